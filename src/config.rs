// =============================================================================
// Feed configuration -- which pairs to watch and how to reach the exchange
// =============================================================================
//
// All fields carry `#[serde(default)]` so a partial (or empty) JSON file is a
// valid configuration.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::feed::binance::DEFAULT_STREAM_BASE_URL;
use crate::types::{TimeInterval, TradingPair};

fn default_pairs() -> Vec<TradingPair> {
    vec![TradingPair::new("BTC", "USDT"), TradingPair::new("ETH", "USDT")]
}

fn default_interval() -> TimeInterval {
    TimeInterval::OneMinute
}

fn default_max_bar_count() -> usize {
    500
}

fn default_stream_base_url() -> String {
    DEFAULT_STREAM_BASE_URL.to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_report_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Pairs to keep a rolling series for.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<TradingPair>,

    #[serde(default = "default_interval")]
    pub interval: TimeInterval,

    /// Bars retained per pair.
    #[serde(default = "default_max_bar_count")]
    pub max_bar_count: usize,

    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// How often the binary logs a summary of each series.
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            pairs: default_pairs(),
            interval: default_interval(),
            max_bar_count: default_max_bar_count(),
            stream_base_url: default_stream_base_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = config.pairs.len(),
            interval = %config.interval,
            "feed config loaded"
        );

        Ok(config)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}
