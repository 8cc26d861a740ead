//! Scripted in-process venue for tests and offline runs.
//!
//! Produces a deterministic candle for every bucket, so the same request
//! always yields the same rows. Failures, upstream holes and "not yet closed"
//! cutoffs can be scripted between calls.

use super::provider::{FetchError, VenueFetcher};
use crate::domain::{Candle, TimeRange};
use crate::timeframe::Timeframe;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Script {
    failures: VecDeque<FetchError>,
    window_failures: HashMap<i64, FetchError>,
    gaps: Vec<TimeRange>,
    unknown_symbols: HashSet<String>,
    corrupt: HashSet<i64>,
    calls: Vec<(String, TimeRange)>,
}

pub struct MockVenue {
    venue: String,
    available_until: AtomicI64,
    stray_rows: AtomicBool,
    script: Mutex<Script>,
}

/// The deterministic candle the mock serves for a bucket.
pub fn synthetic_candle(venue: &str, symbol: &str, timeframe: Timeframe, open_time_ms: i64) -> Candle {
    let idx = open_time_ms.div_euclid(timeframe.duration_ms());
    let price = 100.0 + (idx.rem_euclid(97)) as f64 * 0.5;
    let open = price;
    let close = price + 0.25;
    Candle {
        venue: venue.to_string(),
        symbol: symbol.to_string(),
        timeframe,
        open_time_ms,
        open,
        high: close + 0.5,
        low: open - 0.5,
        close,
        volume: 1.0 + idx.rem_euclid(7) as f64,
    }
}

impl MockVenue {
    pub fn new(venue: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            available_until: AtomicI64::new(i64::MAX),
            stray_rows: AtomicBool::new(false),
            script: Mutex::new(Script::default()),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Only candles that have closed by `ts_ms` are served, like a live
    /// exchange that omits the still-forming bucket.
    pub fn set_available_until(&self, ts_ms: i64) {
        self.available_until.store(ts_ms, Ordering::SeqCst);
    }

    /// The next call fails with `err`. Queued failures are consumed in order.
    pub fn push_failure(&self, err: FetchError) {
        self.script().failures.push_back(err);
    }

    /// Every call whose window starts at `start_ms` fails with `err`.
    pub fn fail_window_at(&self, start_ms: i64, err: FetchError) {
        self.script().window_failures.insert(start_ms, err);
    }

    pub fn clear_window_failures(&self) {
        self.script().window_failures.clear();
    }

    /// The venue has no data in `range` (exchange outage).
    pub fn add_gap(&self, range: TimeRange) {
        self.script().gaps.push(range);
    }

    pub fn add_unknown_symbol(&self, symbol: impl Into<String>) {
        self.script().unknown_symbols.insert(symbol.into());
    }

    /// Serve an invalid row (high below low) at `open_time_ms`.
    pub fn corrupt_at(&self, open_time_ms: i64) {
        self.script().corrupt.insert(open_time_ms);
    }

    /// Also return a row before the window, a row at its end, and a
    /// duplicate of the last row.
    pub fn set_stray_rows(&self, on: bool) {
        self.stray_rows.store(on, Ordering::SeqCst);
    }

    /// Every `(symbol, window)` fetched so far, in call order.
    pub fn calls(&self) -> Vec<(String, TimeRange)> {
        self.script().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script().calls.len()
    }

    fn candle_at(&self, script: &Script, symbol: &str, timeframe: Timeframe, ts: i64) -> Candle {
        let mut candle = synthetic_candle(&self.venue, symbol, timeframe, ts);
        if script.corrupt.contains(&ts) {
            candle.high = candle.low - 1.0;
        }
        candle
    }
}

impl VenueFetcher for MockVenue {
    fn venue(&self) -> &str {
        &self.venue
    }

    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut script = self.script();
        script.calls.push((symbol.to_string(), range));

        if let Some(err) = script.failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = script.window_failures.get(&range.start_ms) {
            return Err(err.clone());
        }
        if script.unknown_symbols.contains(symbol) {
            return Err(FetchError::UnknownSymbol {
                symbol: symbol.to_string(),
            });
        }

        let step = timeframe.duration_ms();
        let available_until = self.available_until.load(Ordering::SeqCst);
        let mut out = Vec::new();
        let mut ts = timeframe.ceil(range.start_ms);
        while ts < range.end_ms {
            let closed = ts.saturating_add(step) <= available_until;
            let in_gap = script.gaps.iter().any(|g| g.contains(ts));
            if closed && !in_gap {
                out.push(self.candle_at(&script, symbol, timeframe, ts));
            }
            ts += step;
        }

        if self.stray_rows.load(Ordering::SeqCst) {
            let before = self.candle_at(&script, symbol, timeframe, timeframe.floor(range.start_ms - 1));
            let after = self.candle_at(&script, symbol, timeframe, timeframe.ceil(range.end_ms));
            if let Some(last) = out.last().cloned() {
                out.push(last);
            }
            out.insert(0, before);
            out.push(after);
        }
        Ok(out)
    }
}
