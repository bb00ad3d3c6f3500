// =============================================================================
// Domain identifiers shared across the kline cache
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to parse a domain identifier from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid trading pair `{0}`, expected BASE/QUOTE")]
    TradingPair(String),
    #[error("unknown time interval `{0}`")]
    TimeInterval(String),
}

/// A base/quote asset pair such as `BTC/USDT`. Serialised as that string.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TradingPair {
    base: String,
    quote: String,
}

impl TradingPair {
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().to_uppercase(),
            quote: quote.as_ref().trim().to_uppercase(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl FromStr for TradingPair {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((base, quote)) if !base.trim().is_empty() && !quote.trim().is_empty() => {
                Ok(Self::new(base, quote))
            }
            _ => Err(ParseError::TradingPair(s.to_string())),
        }
    }
}

impl TryFrom<String> for TradingPair {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TradingPair> for String {
    fn from(pair: TradingPair) -> Self {
        pair.to_string()
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Candle granularity. Serialised as the exchange-style code (`"1m"`, `"4h"`).
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    HalfHourly,
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "2h")]
    TwoHourly,
    #[serde(rename = "4h")]
    FourHourly,
    #[serde(rename = "6h")]
    SixHourly,
    #[serde(rename = "8h")]
    EightHourly,
    #[serde(rename = "12h")]
    TwelveHourly,
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "3d")]
    ThreeDaily,
    #[serde(rename = "1w")]
    Weekly,
    #[serde(rename = "1M")]
    Monthly,
}

impl TimeInterval {
    pub const ALL: [TimeInterval; 15] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::HalfHourly,
        Self::Hourly,
        Self::TwoHourly,
        Self::FourHourly,
        Self::SixHourly,
        Self::EightHourly,
        Self::TwelveHourly,
        Self::Daily,
        Self::ThreeDaily,
        Self::Weekly,
        Self::Monthly,
    ];

    /// Short code, identical to the one used on the wire.
    pub fn code(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::HalfHourly => "30m",
            Self::Hourly => "1h",
            Self::TwoHourly => "2h",
            Self::FourHourly => "4h",
            Self::SixHourly => "6h",
            Self::EightHourly => "8h",
            Self::TwelveHourly => "12h",
            Self::Daily => "1d",
            Self::ThreeDaily => "3d",
            Self::Weekly => "1w",
            Self::Monthly => "1M",
        }
    }
}

impl FromStr for TimeInterval {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|iv| iv.code() == code)
            .ok_or_else(|| ParseError::TimeInterval(s.to_string()))
    }
}

impl std::fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
