// =============================================================================
// Binance kline WebSocket client
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{CandlestickEvent, CandlestickFeed, CandlestickHandler};

pub const DEFAULT_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443";

/// Kline feed over the public Binance market-data WebSocket.
///
/// One connection per subscription. When the stream ends or fails the client
/// waits `reconnect_delay` and connects again, forever.
#[derive(Debug, Clone)]
pub struct BinanceKlineFeed {
    base_url: String,
    reconnect_delay: Duration,
}

impl BinanceKlineFeed {
    pub fn new(base_url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reconnect_delay,
        }
    }

    /// Single-stream URL for `(symbol, interval)`.
    pub fn stream_url(&self, symbol: &str, interval: &str) -> String {
        let lower = symbol.to_lowercase();
        format!("{}/ws/{lower}@kline_{interval}", self.base_url)
    }
}

impl Default for BinanceKlineFeed {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BASE_URL, Duration::from_secs(5))
    }
}

#[async_trait]
impl CandlestickFeed for BinanceKlineFeed {
    async fn subscribe(
        &self,
        symbol: &str,
        interval: &str,
        mut handler: CandlestickHandler,
    ) -> Result<()> {
        let url = self.stream_url(symbol, interval);
        loop {
            match run_kline_stream(&url, &mut handler).await {
                Ok(()) => {
                    warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                }
                Err(e) => {
                    error!(symbol = %symbol, interval = %interval, error = %e, "kline stream error");
                }
            }
            info!(
                symbol = %symbol,
                delay_secs = self.reconnect_delay.as_secs(),
                "reconnecting kline WebSocket"
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

/// Connect to one kline stream and hand every parsed event to `handler`.
///
/// Returns when the server closes the stream or a read fails.
async fn run_kline_stream(url: &str, handler: &mut CandlestickHandler) -> Result<()> {
    info!(url = %url, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(url = %url, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match parse_kline_message(&text) {
                Ok(event) => {
                    debug!(
                        symbol = %event.symbol,
                        close_time = event.close_time,
                        closed = event.is_closed,
                        "kline update"
                    );
                    handler(event);
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse kline message");
                }
            },
            Ok(Message::Close(frame)) => {
                info!(url = %url, frame = ?frame, "kline WebSocket closed by server");
                break;
            }
            // tungstenite answers pings itself.
            Ok(_) => {}
            Err(e) => {
                return Err(e).context("kline WebSocket read error");
            }
        }
    }
    Ok(())
}

/// Parse a kline message, either the bare single-stream payload
/// `{ "e": "kline", "s": "BTCUSDT", "k": { ... } }` or the same wrapped in a
/// combined-stream envelope `{ "stream": ..., "data": { ... } }`.
pub fn parse_kline_message(text: &str) -> Result<CandlestickEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    Ok(CandlestickEvent {
        symbol,
        interval: k["i"].as_str().context("missing field k.i")?.to_string(),
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: decimal_text(&k["o"], "k.o")?,
        high: decimal_text(&k["h"], "k.h")?,
        low: decimal_text(&k["l"], "k.l")?,
        close: decimal_text(&k["c"], "k.c")?,
        volume: decimal_text(&k["v"], "k.v")?,
        trades: k["n"].as_u64().context("missing field k.n")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// Binance sends decimals as strings; tolerate bare numbers too.
fn decimal_text(val: &serde_json::Value, name: &str) -> Result<String> {
    match val {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
