// =============================================================================
// MarketProvider -- rolling bar series per trading pair, fed by a kline stream
// =============================================================================
//
// The first request for a pair creates its series and starts one background
// subscription; every later request gets the same live series back.
//
// Thread safety:
//   - The registry insert happens under the write lock, so exactly one caller
//     creates a pair's series and only that caller spawns its subscription.
//   - Each BarSeries locks itself; the close-time table has its own lock.
//   - Events for one pair arrive through one callback, in feed order.
// =============================================================================

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bar::Bar;
use crate::feed::{CandlestickEvent, CandlestickFeed, CandlestickHandler};
use crate::mapping::{exchange_interval, exchange_symbol};
use crate::series::{BarSeries, SeriesError};
use crate::types::{TimeInterval, TradingPair};

/// What an accepted event did to its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    /// The in-progress candle was replaced.
    Updated,
    /// The previous candle closed and a new bar was appended.
    Appended,
}

/// State shared between callers and every subscription callback.
#[derive(Default)]
struct SharedState {
    series: RwLock<HashMap<TradingPair, Arc<BarSeries>>>,
    /// Close time (epoch millis) of the candle each pair is currently forming.
    last_close: RwLock<HashMap<TradingPair, i64>>,
}

impl SharedState {
    /// Merge one feed event into `series`.
    ///
    /// An event closing at the tracked time replaces the last bar; a later
    /// close time appends and becomes the tracked time. Earlier close times
    /// are rejected and leave everything untouched.
    fn merge(
        &self,
        pair: &TradingPair,
        series: &BarSeries,
        event: &CandlestickEvent,
    ) -> Result<MergeOutcome> {
        let bar = Bar::from_event(event)?;

        let last_close = *self
            .last_close
            .write()
            .entry(pair.clone())
            .or_insert(event.close_time);

        if event.close_time == last_close {
            series.add_bar(bar, true)?;
            debug!(pair = %pair, close = %event.close, "in-progress bar updated");
            return Ok(MergeOutcome::Updated);
        }

        if event.close_time < last_close {
            anyhow::bail!(
                "out-of-order event: close time {} is before current candle close {}",
                event.close_time,
                last_close
            );
        }

        let summary = bar.to_string();
        series.add_bar(bar, false)?;
        self.last_close.write().insert(pair.clone(), event.close_time);
        info!(pair = %pair, bar = %summary, "adding new bar");
        Ok(MergeOutcome::Appended)
    }
}

/// Domain-facing access to live bar series.
pub struct MarketProvider {
    state: Arc<SharedState>,
    feed: Arc<dyn CandlestickFeed>,
    executor: Handle,
    subscriptions: Mutex<HashMap<TradingPair, JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MarketProvider {
    /// `executor` runs the subscription tasks; the provider never blocks on it.
    pub fn new(feed: Arc<dyn CandlestickFeed>, executor: Handle) -> Self {
        Self {
            state: Arc::new(SharedState::default()),
            feed,
            executor,
            subscriptions: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Return the live series for `pair`, creating it and starting its
    /// subscription on first request.
    ///
    /// Only the first call's `interval` and `max_bar_count` are used; later
    /// calls for the same pair return the existing series unchanged. Fails
    /// only when a new series cannot be built (`max_bar_count == 0`).
    pub fn get_bar_series(
        &self,
        pair: &TradingPair,
        interval: TimeInterval,
        max_bar_count: usize,
    ) -> Result<Arc<BarSeries>, SeriesError> {
        if let Some(series) = self.state.series.read().get(pair) {
            return Ok(Arc::clone(series));
        }

        let series = {
            let mut registry = self.state.series.write();
            match registry.entry(pair.clone()) {
                Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
                Entry::Vacant(slot) => {
                    let series = Arc::new(BarSeries::new(
                        exchange_symbol(pair),
                        pair.clone(),
                        interval,
                        max_bar_count,
                    )?);
                    slot.insert(Arc::clone(&series));
                    series
                }
            }
        };

        self.start_subscription(pair.clone(), interval, Arc::clone(&series));
        Ok(series)
    }

    fn start_subscription(&self, pair: TradingPair, interval: TimeInterval, series: Arc<BarSeries>) {
        let mut subscriptions = self.subscriptions.lock();
        if self.shut_down.load(Ordering::Acquire) {
            warn!(pair = %pair, "provider is shut down, series will not receive updates");
            return;
        }

        let symbol = exchange_symbol(&pair);
        let code = exchange_interval(interval);
        let feed = Arc::clone(&self.feed);
        let state = Arc::clone(&self.state);
        let task_pair = pair.clone();

        let handle = self.executor.spawn(async move {
            info!(pair = %task_pair, symbol = %symbol, interval = code, "starting kline subscription");

            let handler_pair = task_pair.clone();
            let handler: CandlestickHandler = Box::new(move |event| {
                if let Err(e) = state.merge(&handler_pair, &series, &event) {
                    warn!(
                        pair = %handler_pair,
                        close_time = event.close_time,
                        error = %e,
                        "dropping candlestick event"
                    );
                }
            });

            match feed.subscribe(&symbol, code, handler).await {
                Ok(()) => info!(pair = %task_pair, "kline subscription finished"),
                Err(e) => error!(pair = %task_pair, error = %e, "kline subscription failed"),
            }
        });

        subscriptions.insert(pair, handle);
    }

    /// Pairs that currently have a series.
    pub fn tracked_pairs(&self) -> Vec<TradingPair> {
        self.state.series.read().keys().cloned().collect()
    }

    /// Close time of the candle `pair` is currently forming.
    pub fn last_close_time(&self, pair: &TradingPair) -> Option<i64> {
        self.state.last_close.read().get(pair).copied()
    }

    /// Number of subscription tasks still running.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Abort every subscription. Series stay readable with their last bars,
    /// and no new subscription is started afterwards.
    pub fn shutdown(&self) {
        let mut subscriptions = self.subscriptions.lock();
        self.shut_down.store(true, Ordering::Release);
        let count = subscriptions.len();
        for (_, handle) in subscriptions.drain() {
            handle.abort();
        }
        info!(subscriptions = count, "market provider shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    /// Feed whose events are pushed by the test through a channel per symbol.
    #[derive(Default)]
    struct ChannelFeed {
        subscribe_calls: AtomicUsize,
        senders: Mutex<HashMap<String, mpsc::UnboundedSender<CandlestickEvent>>>,
    }

    #[async_trait]
    impl CandlestickFeed for ChannelFeed {
        async fn subscribe(
            &self,
            symbol: &str,
            _interval: &str,
            mut handler: CandlestickHandler,
        ) -> Result<()> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.senders.lock().insert(symbol.to_string(), tx);
            while let Some(event) = rx.recv().await {
                handler(event);
            }
            Ok(())
        }
    }

    impl ChannelFeed {
        fn sender(&self, symbol: &str) -> Option<mpsc::UnboundedSender<CandlestickEvent>> {
            self.senders.lock().get(symbol).cloned()
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within 2s");
    }

    fn kline(open_time: i64, close_time: i64, close: &str) -> CandlestickEvent {
        CandlestickEvent {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            open_time,
            close_time,
            open: "100".into(),
            high: "110".into(),
            low: "90".into(),
            close: close.into(),
            volume: "12.5".into(),
            trades: 7,
            is_closed: false,
        }
    }

    /// Candle `n` of a one-minute series.
    fn minute(n: i64, close: &str) -> CandlestickEvent {
        kline(n * 60_000, n * 60_000 + 59_999, close)
    }

    fn btc() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn fresh_series(max: usize) -> BarSeries {
        BarSeries::new("BTCUSDT", btc(), TimeInterval::OneMinute, max).unwrap()
    }

    #[test]
    fn same_close_time_replaces_in_progress_bar() {
        let state = SharedState::default();
        let series = fresh_series(10);

        assert_eq!(state.merge(&btc(), &series, &minute(0, "101")).unwrap(), MergeOutcome::Updated);
        assert_eq!(state.merge(&btc(), &series, &minute(0, "102.5")).unwrap(), MergeOutcome::Updated);

        assert_eq!(series.bar_count(), 1);
        assert_eq!(series.last_bar().unwrap().close, dec!(102.5));
    }

    #[test]
    fn later_close_time_rolls_over() {
        let state = SharedState::default();
        let series = fresh_series(10);

        state.merge(&btc(), &series, &minute(0, "101")).unwrap();
        let outcome = state.merge(&btc(), &series, &minute(1, "105")).unwrap();

        assert_eq!(outcome, MergeOutcome::Appended);
        let bars = series.bars();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(101));
        assert_eq!(bars[0].end_time.timestamp_millis(), 59_999);
        assert_eq!(bars[1].close, dec!(105));
        assert_eq!(bars[1].end_time.timestamp_millis(), 119_999);
        assert_eq!(state.last_close.read().get(&btc()), Some(&119_999));
    }

    #[test]
    fn series_stays_bounded_with_most_recent_bars() {
        let state = SharedState::default();
        let series = fresh_series(3);

        for n in 0..6 {
            // Two ticks per candle.
            state.merge(&btc(), &series, &minute(n, "1")).unwrap();
            state.merge(&btc(), &series, &minute(n, &format!("{}", 100 + n))).unwrap();
        }

        let ends: Vec<i64> = series.bars().iter().map(|b| b.end_time.timestamp_millis()).collect();
        assert_eq!(ends, vec![3 * 60_000 + 59_999, 4 * 60_000 + 59_999, 5 * 60_000 + 59_999]);
        assert_eq!(series.closes(3), vec![dec!(103), dec!(104), dec!(105)]);
        assert_eq!(series.removed_bars_count(), 3);
    }

    #[test]
    fn bar_period_uses_inclusive_close() {
        let state = SharedState::default();
        let series = fresh_series(5);
        state.merge(&btc(), &series, &kline(1_000, 4_999, "1")).unwrap();
        assert_eq!(series.last_bar().unwrap().time_period, chrono::Duration::milliseconds(4_000));
    }

    #[test]
    fn out_of_order_event_is_rejected() {
        let state = SharedState::default();
        let series = fresh_series(5);
        state.merge(&btc(), &series, &minute(5, "1")).unwrap();
        state.merge(&btc(), &series, &minute(6, "2")).unwrap();

        let err = state.merge(&btc(), &series, &minute(4, "3")).unwrap_err();
        assert!(err.to_string().contains("out-of-order"));
        assert_eq!(series.closes(5), vec![dec!(1), dec!(2)]);
        assert_eq!(state.last_close.read().get(&btc()), Some(&(6 * 60_000 + 59_999)));
    }

    #[test]
    fn malformed_event_leaves_state_untouched() {
        let state = SharedState::default();
        let series = fresh_series(5);

        assert!(state.merge(&btc(), &series, &minute(0, "garbage")).is_err());
        assert!(series.is_empty());
        assert!(state.last_close.read().get(&btc()).is_none());

        state.merge(&btc(), &series, &minute(0, "7")).unwrap();
        assert_eq!(series.bar_count(), 1);
    }

    #[tokio::test]
    async fn repeated_requests_return_the_same_series() {
        let feed = Arc::new(ChannelFeed::default());
        let provider = MarketProvider::new(feed.clone(), Handle::current());

        let first = provider.get_bar_series(&btc(), TimeInterval::OneMinute, 10).unwrap();
        let second = provider.get_bar_series(&btc(), TimeInterval::Hourly, 99).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.interval(), TimeInterval::OneMinute);
        assert_eq!(second.max_bar_count(), 10);
        assert_eq!(second.name(), "BTCUSDT");

        wait_until(|| feed.subscribe_calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(provider.tracked_pairs(), vec![btc()]);
    }

    #[tokio::test]
    async fn invalid_capacity_is_returned_to_caller() {
        let feed = Arc::new(ChannelFeed::default());
        let provider = MarketProvider::new(feed.clone(), Handle::current());

        let err = provider.get_bar_series(&btc(), TimeInterval::OneMinute, 0).unwrap_err();
        assert_eq!(err, SeriesError::InvalidMaxBarCount);
        assert!(provider.tracked_pairs().is_empty());
        assert_eq!(provider.active_subscriptions(), 0);

        // A valid retry still works.
        assert!(provider.get_bar_series(&btc(), TimeInterval::OneMinute, 1).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_subscription() {
        let feed = Arc::new(ChannelFeed::default());
        let provider = Arc::new(MarketProvider::new(feed.clone(), Handle::current()));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let provider = provider.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                provider.get_bar_series(&btc(), TimeInterval::OneMinute, 10 + i).unwrap()
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.push(task.await.unwrap());
        }
        assert!(all.iter().all(|s| Arc::ptr_eq(s, &all[0])));

        wait_until(|| feed.subscribe_calls.load(Ordering::SeqCst) >= 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(feed.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn feed_events_reach_the_returned_series() {
        let feed = Arc::new(ChannelFeed::default());
        let provider = MarketProvider::new(feed.clone(), Handle::current());
        let series = provider.get_bar_series(&btc(), TimeInterval::OneMinute, 10).unwrap();
        assert!(series.is_empty());

        wait_until(|| feed.sender("BTCUSDT").is_some()).await;
        let tx = feed.sender("BTCUSDT").unwrap();
        tx.send(minute(0, "100")).unwrap();
        tx.send(minute(0, "bad")).unwrap();
        tx.send(minute(0, "101")).unwrap();
        tx.send(minute(1, "102")).unwrap();

        wait_until(|| series.bar_count() == 2).await;
        assert_eq!(series.closes(2), vec![dec!(101), dec!(102)]);
        assert_eq!(provider.last_close_time(&btc()), Some(119_999));
    }

    #[tokio::test]
    async fn subscription_survives_rejected_events() {
        let feed = Arc::new(ChannelFeed::default());
        let provider = MarketProvider::new(feed.clone(), Handle::current());
        let series = provider.get_bar_series(&btc(), TimeInterval::OneMinute, 10).unwrap();

        wait_until(|| feed.sender("BTCUSDT").is_some()).await;
        let tx = feed.sender("BTCUSDT").unwrap();

        // Period overflows i64.
        tx.send(kline(i64::MIN, 0, "1")).unwrap();
        tx.send(minute(1, "100")).unwrap();
        wait_until(|| series.bar_count() == 1).await;

        // Close before open.
        tx.send(kline(3 * 60_000, 2 * 60_000, "2")).unwrap();
        tx.send(minute(2, "101")).unwrap();
        wait_until(|| series.bar_count() == 2).await;

        // Close time past what DateTime can hold.
        tx.send(kline(0, i64::MAX - 1, "3")).unwrap();
        // Older than the candle being formed.
        tx.send(minute(0, "4")).unwrap();
        tx.send(minute(3, "102")).unwrap();
        wait_until(|| series.bar_count() == 3).await;

        assert!(!tx.is_closed());
        assert_eq!(provider.active_subscriptions(), 1);
        assert_eq!(series.closes(3), vec![dec!(100), dec!(101), dec!(102)]);
        assert_eq!(provider.last_close_time(&btc()), Some(3 * 60_000 + 59_999));
    }

    #[tokio::test]
    async fn shutdown_stops_updates_and_keeps_bars() {
        let feed = Arc::new(ChannelFeed::default());
        let provider = MarketProvider::new(feed.clone(), Handle::current());
        let series = provider.get_bar_series(&btc(), TimeInterval::OneMinute, 10).unwrap();

        wait_until(|| feed.sender("BTCUSDT").is_some()).await;
        let tx = feed.sender("BTCUSDT").unwrap();
        tx.send(minute(0, "100")).unwrap();
        wait_until(|| series.bar_count() == 1).await;

        provider.shutdown();
        wait_until(|| tx.is_closed()).await;
        assert_eq!(provider.active_subscriptions(), 0);
        assert_eq!(series.last_bar().unwrap().close, dec!(100));

        // Known pair: same series back. New pair: series but no subscription.
        let again = provider.get_bar_series(&btc(), TimeInterval::OneMinute, 10).unwrap();
        assert!(Arc::ptr_eq(&series, &again));
        let eth = TradingPair::new("ETH", "USDT");
        assert!(provider.get_bar_series(&eth, TimeInterval::OneMinute, 10).is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feed.subscribe_calls.load(Ordering::SeqCst), 1);
    }
}
