// =============================================================================
// Bar -- immutable OHLCV candle with exact decimal prices
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::feed::CandlestickEvent;

/// One OHLCV candle. Never mutated; an in-progress candle is replaced by a
/// fresh `Bar` on every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bar {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Traded amount. The kline feed reports base volume here as well.
    pub amount: Decimal,
    pub trades: u64,
    pub end_time: DateTime<Utc>,
    pub time_period: Duration,
}

impl Bar {
    /// Decode a feed event into a bar.
    ///
    /// The period is `close_time - open_time + 1` milliseconds: kline close
    /// times are inclusive (`...59_999`), so the extra millisecond makes
    /// consecutive periods abut exactly.
    pub fn from_event(event: &CandlestickEvent) -> Result<Self> {
        if event.close_time < event.open_time {
            anyhow::bail!(
                "close time {} precedes open time {}",
                event.close_time,
                event.open_time
            );
        }

        let period_ms = event
            .close_time
            .checked_sub(event.open_time)
            .and_then(|d| d.checked_add(1))
            .with_context(|| {
                format!(
                    "period from {} to {} overflows",
                    event.open_time, event.close_time
                )
            })?;
        let time_period = Duration::try_milliseconds(period_ms)
            .with_context(|| format!("period of {period_ms} ms out of range"))?;

        let volume = parse_decimal(&event.volume, "volume")?;
        let end_time = Utc
            .timestamp_millis_opt(event.close_time)
            .single()
            .with_context(|| format!("close time {} out of range", event.close_time))?;

        Ok(Self {
            open: parse_decimal(&event.open, "open")?,
            high: parse_decimal(&event.high, "high")?,
            low: parse_decimal(&event.low, "low")?,
            close: parse_decimal(&event.close, "close")?,
            volume,
            amount: volume,
            trades: event.trades,
            end_time,
            time_period,
        })
    }
}

impl std::fmt::Display for Bar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "end={} open={} high={} low={} close={} volume={} trades={}",
            self.end_time.to_rfc3339(),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.trades
        )
    }
}

/// The feed sends numeric values as JSON strings; keep them exact. Exponent
/// notation (`1e-7`) shows up when a value arrived as a bare JSON number.
fn parse_decimal(val: &str, name: &str) -> Result<Decimal> {
    let text = val.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .with_context(|| format!("failed to parse {name} as decimal: {val}"))
}
