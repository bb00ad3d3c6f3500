//! Rolling OHLCV bar series per trading pair, maintained from an exchange's
//! kline WebSocket feed.
//!
//! [`MarketProvider::get_bar_series`] hands out a live [`BarSeries`]; the
//! first request for a pair starts a background subscription that keeps the
//! series current.

pub mod bar;
pub mod config;
pub mod feed;
pub mod mapping;
pub mod provider;
pub mod series;
pub mod types;

pub use bar::Bar;
pub use config::FeedConfig;
pub use feed::{BinanceKlineFeed, CandlestickEvent, CandlestickFeed, CandlestickHandler};
pub use provider::MarketProvider;
pub use series::{BarSeries, SeriesError};
pub use types::{ParseError, TimeInterval, TradingPair};
