// =============================================================================
// BarSeries -- thread-safe bounded rolling window of bars
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::bar::Bar;
use crate::types::{TimeInterval, TradingPair};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeriesError {
    #[error("max bar count must be positive")]
    InvalidMaxBarCount,
    #[error("bar end time {end} is not after the last bar's end time {last}")]
    NonIncreasingEndTime {
        end: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

struct Window {
    bars: VecDeque<Bar>,
    /// Bars evicted from the front since creation.
    removed: usize,
}

/// Ordered, bounded sequence of bars for one pair and interval.
///
/// The series synchronises itself: the feed callback appends and replaces
/// while any number of readers take snapshots. Bars are addressed by a
/// series-wide index that keeps counting across evictions, so
/// `begin_index()` advances as old bars fall out of the window.
pub struct BarSeries {
    name: String,
    pair: TradingPair,
    interval: TimeInterval,
    max_bar_count: usize,
    window: RwLock<Window>,
}

impl BarSeries {
    pub fn new(
        name: impl Into<String>,
        pair: TradingPair,
        interval: TimeInterval,
        max_bar_count: usize,
    ) -> Result<Self, SeriesError> {
        if max_bar_count == 0 {
            return Err(SeriesError::InvalidMaxBarCount);
        }
        Ok(Self {
            name: name.into(),
            pair,
            interval,
            max_bar_count,
            window: RwLock::new(Window {
                bars: VecDeque::with_capacity(max_bar_count),
                removed: 0,
            }),
        })
    }

    /// Add a bar to the end of the series.
    ///
    /// * `replace == true` swaps out the last bar (the in-progress candle). On
    ///   an empty series the bar is simply appended.
    /// * Otherwise the bar is appended; its end time must be strictly after
    ///   the current last bar's. The oldest bar is evicted once the series
    ///   would exceed `max_bar_count`.
    pub fn add_bar(&self, bar: Bar, replace: bool) -> Result<(), SeriesError> {
        let mut window = self.window.write();

        if let Some(last) = window.bars.back_mut() {
            if replace {
                *last = bar;
                return Ok(());
            }
            if bar.end_time <= last.end_time {
                return Err(SeriesError::NonIncreasingEndTime {
                    end: bar.end_time,
                    last: last.end_time,
                });
            }
        }

        window.bars.push_back(bar);
        while window.bars.len() > self.max_bar_count {
            window.bars.pop_front();
            window.removed += 1;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pair(&self) -> &TradingPair {
        &self.pair
    }

    pub fn interval(&self) -> TimeInterval {
        self.interval
    }

    pub fn max_bar_count(&self) -> usize {
        self.max_bar_count
    }

    pub fn bar_count(&self) -> usize {
        self.window.read().bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.read().bars.is_empty()
    }

    pub fn removed_bars_count(&self) -> usize {
        self.window.read().removed
    }

    /// Index of the oldest retained bar, `None` while empty.
    pub fn begin_index(&self) -> Option<usize> {
        let window = self.window.read();
        (!window.bars.is_empty()).then_some(window.removed)
    }

    /// Index of the newest bar, `None` while empty.
    pub fn end_index(&self) -> Option<usize> {
        let window = self.window.read();
        (!window.bars.is_empty()).then(|| window.removed + window.bars.len() - 1)
    }

    /// Bar at a series-wide index; `None` if evicted or not yet received.
    pub fn get_bar(&self, index: usize) -> Option<Bar> {
        let window = self.window.read();
        index
            .checked_sub(window.removed)
            .and_then(|i| window.bars.get(i))
            .cloned()
    }

    pub fn first_bar(&self) -> Option<Bar> {
        self.window.read().bars.front().cloned()
    }

    pub fn last_bar(&self) -> Option<Bar> {
        self.window.read().bars.back().cloned()
    }

    /// Snapshot of every retained bar, oldest first.
    pub fn bars(&self) -> Vec<Bar> {
        self.window.read().bars.iter().cloned().collect()
    }

    /// The most recent `count` close prices, oldest first.
    pub fn closes(&self, count: usize) -> Vec<Decimal> {
        let window = self.window.read();
        let start = window.bars.len().saturating_sub(count);
        window.bars.iter().skip(start).map(|b| b.close).collect()
    }
}

impl std::fmt::Debug for BarSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarSeries")
            .field("name", &self.name)
            .field("pair", &self.pair)
            .field("interval", &self.interval)
            .field("max_bar_count", &self.max_bar_count)
            .field("bar_count", &self.bar_count())
            .finish()
    }
}
