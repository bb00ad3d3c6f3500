// =============================================================================
// Candlestick feed -- the upstream collaborator the cache subscribes to
// =============================================================================

pub mod binance;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use binance::BinanceKlineFeed;

/// One kline update as delivered by the exchange.
///
/// Prices and volume stay in the exchange's textual decimal form; turning
/// them into numbers is part of building a bar, so a malformed value only
/// costs the one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandlestickEvent {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub trades: u64,
    pub is_closed: bool,
}

/// Callback invoked once per event, in delivery order.
pub type CandlestickHandler = Box<dyn FnMut(CandlestickEvent) + Send>;

/// Source of candlestick updates for an exchange symbol and interval.
#[async_trait]
pub trait CandlestickFeed: Send + Sync {
    /// Subscribe and invoke `handler` with every update.
    ///
    /// Resolves only when the subscription ends for good; connection upkeep
    /// is the implementation's business.
    async fn subscribe(&self, symbol: &str, interval: &str, handler: CandlestickHandler)
        -> Result<()>;
}
