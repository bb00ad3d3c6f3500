// =============================================================================
// Exchange translation table -- domain identifiers to Binance names
// =============================================================================

use crate::types::{TimeInterval, TradingPair};

/// Binance spot symbol, e.g. `BTC/USDT` -> `BTCUSDT`.
pub fn exchange_symbol(pair: &TradingPair) -> String {
    format!("{}{}", pair.base(), pair.quote())
}

/// Binance kline interval code. The domain codes already follow Binance.
pub fn exchange_interval(interval: TimeInterval) -> &'static str {
    interval.code()
}
