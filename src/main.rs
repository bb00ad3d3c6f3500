// =============================================================================
// kline-cache -- keep rolling bar series for the configured pairs
// =============================================================================

use std::sync::Arc;

use kline_cache::{BarSeries, BinanceKlineFeed, FeedConfig, MarketProvider, TradingPair};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "kline_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    apply_env_overrides(&mut config);

    info!(
        pairs = ?config.pairs.iter().map(ToString::to_string).collect::<Vec<_>>(),
        interval = %config.interval,
        max_bar_count = config.max_bar_count,
        "Configured kline cache"
    );

    // ── 2. Provider & series ─────────────────────────────────────────────
    let feed = Arc::new(BinanceKlineFeed::new(
        config.stream_base_url.clone(),
        config.reconnect_delay(),
    ));
    let provider = Arc::new(MarketProvider::new(feed, tokio::runtime::Handle::current()));

    let mut watched: Vec<Arc<BarSeries>> = Vec::new();
    for pair in &config.pairs {
        let series = provider.get_bar_series(pair, config.interval, config.max_bar_count)?;
        watched.push(series);
    }
    info!(count = watched.len(), "Kline subscriptions launched");

    // ── 3. Periodic report ───────────────────────────────────────────────
    let report_every = config.report_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_every);
        loop {
            interval.tick().await;
            for series in &watched {
                match series.last_bar() {
                    Some(bar) => info!(
                        pair = %series.pair(),
                        bars = series.bar_count(),
                        close = %bar.close,
                        end = %bar.end_time,
                        "series status"
                    ),
                    None => info!(pair = %series.pair(), "series status: no bars yet"),
                }
            }
        }
    });

    // ── 4. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping subscriptions");
    provider.shutdown();
    Ok(())
}

/// `KLINE_PAIRS` (comma separated `BASE/QUOTE`), `KLINE_INTERVAL` and
/// `KLINE_MAX_BARS` override the file.
fn apply_env_overrides(config: &mut FeedConfig) {
    if let Ok(raw) = std::env::var("KLINE_PAIRS") {
        let pairs: Vec<TradingPair> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse() {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(value = %s, error = %e, "ignoring KLINE_PAIRS entry");
                    None
                }
            })
            .collect();
        if !pairs.is_empty() {
            config.pairs = pairs;
        }
    }
    if let Ok(raw) = std::env::var("KLINE_INTERVAL") {
        match raw.parse() {
            Ok(interval) => config.interval = interval,
            Err(e) => warn!(error = %e, "ignoring KLINE_INTERVAL"),
        }
    }
    if let Ok(raw) = std::env::var("KLINE_MAX_BARS") {
        match raw.trim().parse() {
            Ok(max) => config.max_bar_count = max,
            Err(e) => warn!(value = %raw, error = %e, "ignoring KLINE_MAX_BARS"),
        }
    }
}
