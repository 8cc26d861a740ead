//! Store-backed aggregation: chunked reads of the base series, one pass for
//! every target timeframe, idempotent upserts of closed buckets.

use super::aggregator::{Aggregator, GapDetected, HeldBucket};
use super::AggregateError;
use crate::clock::{Clock, EndBound, SystemClock};
use crate::domain::{Candle, SeriesKey, TimeRange};
use crate::store::CandleStore;
use crate::timeframe::{Timeframe, ONE_MINUTE};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateRequest {
    pub key: SeriesKey,
    pub base_timeframe: Timeframe,
    pub targets: Vec<Timeframe>,
    /// `None` resumes from the lowest per-timeframe cursor.
    pub start_ms: Option<i64>,
    pub end: EndBound,
    pub chunk_days: u32,
}

impl AggregateRequest {
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>, targets: Vec<Timeframe>) -> Self {
        Self {
            key: SeriesKey::new(venue, symbol),
            base_timeframe: ONE_MINUTE,
            targets,
            start_ms: None,
            end: EndBound::Now,
            chunk_days: 7,
        }
    }

    pub fn with_start(mut self, start_ms: i64) -> Self {
        self.start_ms = Some(start_ms);
        self
    }

    pub fn with_end(mut self, end: EndBound) -> Self {
        self.end = end;
        self
    }

    pub fn with_chunk_days(mut self, chunk_days: u32) -> Self {
        self.chunk_days = chunk_days;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeframeReport {
    pub timeframe: Timeframe,
    /// Closed buckets produced by this pass.
    pub emitted: usize,
    /// Rows actually inserted or changed; zero on an unchanged re-run.
    pub written: usize,
    pub held: Vec<HeldBucket>,
    pub gaps: Vec<GapDetected>,
    /// Highest bucket stored for this timeframe after the pass.
    pub cursor: Option<i64>,
    /// blake3 over the emitted rows, in order.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub key: SeriesKey,
    /// Base span read, after widening to bucket edges. `None` if there was
    /// nothing to read.
    pub span: Option<TimeRange>,
    pub base_rows_read: usize,
    pub timeframes: Vec<TimeframeReport>,
    pub digest: String,
}

impl AggregateReport {
    pub fn timeframe(&self, timeframe: Timeframe) -> Option<&TimeframeReport> {
        self.timeframes.iter().find(|t| t.timeframe == timeframe)
    }

    pub fn total_written(&self) -> usize {
        self.timeframes.iter().map(|t| t.written).sum()
    }

    pub fn gap_count(&self) -> usize {
        self.timeframes.iter().map(|t| t.gaps.len()).sum()
    }
}

struct TimeframeState {
    report: TimeframeReport,
    hasher: blake3::Hasher,
}

impl TimeframeState {
    fn new(timeframe: Timeframe) -> Self {
        Self {
            report: TimeframeReport {
                timeframe,
                emitted: 0,
                written: 0,
                held: Vec::new(),
                gaps: Vec::new(),
                cursor: None,
                digest: String::new(),
            },
            hasher: blake3::Hasher::new(),
        }
    }

    fn absorb(&mut self, candle: &Candle) {
        self.report.emitted += 1;
        self.hasher.update(&candle.open_time_ms.to_le_bytes());
        for value in [candle.open, candle.high, candle.low, candle.close, candle.volume] {
            self.hasher.update(&value.to_bits().to_le_bytes());
        }
    }
}

pub struct AggregationEngine {
    store: Arc<dyn CandleStore>,
    clock: Arc<dyn Clock>,
    cancel: Arc<AtomicBool>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Lowest cursor across `targets`, or `None` if any target has no rows
    /// yet (it then needs the whole base series).
    pub fn resume_point(
        &self,
        key: &SeriesKey,
        targets: &[Timeframe],
    ) -> Result<Option<i64>, AggregateError> {
        let mut lowest: Option<i64> = None;
        for &target in targets {
            match self.store.latest_open_time(key, target)? {
                Some(cursor) => lowest = Some(lowest.map_or(cursor, |l| l.min(cursor))),
                None => return Ok(None),
            }
        }
        Ok(lowest)
    }

    pub fn run(&self, req: &AggregateRequest) -> Result<AggregateReport, AggregateError> {
        if req.chunk_days == 0 {
            return Err(AggregateError::InvalidRequest("chunk_days must be at least 1".into()));
        }
        let base = req.base_timeframe;
        let mut aggregator = Aggregator::new(req.key.clone(), base, &req.targets)?;
        let targets = aggregator.targets();
        let mut states: Vec<TimeframeState> =
            targets.iter().map(|&t| TimeframeState::new(t)).collect();

        let now = self.clock.now_ms();
        let mut span = None;
        let mut base_rows_read = 0;

        if let Some((first_base, last_base)) = self.store.time_bounds(&req.key, base)? {
            let start = match req.start_ms {
                Some(start) => start,
                None => self.resume_point(&req.key, &targets)?.unwrap_or(first_base),
            }
            .max(first_base);
            let end = req
                .end
                .resolve(self.clock.as_ref())
                .min(last_base + base.duration_ms());

            if start < end {
                let widened = widen(&targets, start, end);
                info!(series = %req.key, span = %widened, targets = targets.len(), "aggregating");
                span = Some(widened);

                let chunk_ms = i64::from(req.chunk_days) * DAY_MS;
                for chunk in widened.split(chunk_ms) {
                    if self.cancel.load(Ordering::SeqCst) {
                        return Err(AggregateError::Cancelled);
                    }
                    let rows = self.store.read_candles(&req.key, base, chunk)?;
                    debug!(series = %req.key, %chunk, rows = rows.len(), "read base chunk");
                    base_rows_read += rows.len();
                    for candle in &rows {
                        aggregator.push(candle);
                    }
                    self.flush(&mut aggregator, &mut states)?;
                }
                aggregator.finish(now, Some(last_base));
                self.flush(&mut aggregator, &mut states)?;
            }
        }

        for held in aggregator.take_held() {
            if let Some(state) = states.iter_mut().find(|s| s.report.timeframe == held.timeframe) {
                state.report.held.push(held);
            }
        }
        for gap in aggregator.take_gaps() {
            if let Some(state) = states.iter_mut().find(|s| s.report.timeframe == gap.timeframe) {
                state.report.gaps.push(gap);
            }
        }

        let mut overall = blake3::Hasher::new();
        let mut timeframes = Vec::with_capacity(states.len());
        for state in states {
            let mut report = state.report;
            report.cursor = self.store.latest_open_time(&req.key, report.timeframe)?;
            let digest = state.hasher.finalize();
            overall.update(report.timeframe.label().as_bytes());
            overall.update(digest.as_bytes());
            report.digest = digest.to_hex().to_string();
            info!(
                series = %req.key,
                timeframe = %report.timeframe,
                emitted = report.emitted,
                written = report.written,
                held = report.held.len(),
                gaps = report.gaps.len(),
                "timeframe aggregated"
            );
            timeframes.push(report);
        }

        Ok(AggregateReport {
            key: req.key.clone(),
            span,
            base_rows_read,
            timeframes,
            digest: overall.finalize().to_hex().to_string(),
        })
    }

    fn flush(
        &self,
        aggregator: &mut Aggregator,
        states: &mut [TimeframeState],
    ) -> Result<(), AggregateError> {
        let closed = aggregator.take_closed();
        if closed.is_empty() {
            return Ok(());
        }
        for state in states.iter_mut() {
            let rows: Vec<Candle> = closed
                .iter()
                .filter(|c| c.timeframe == state.report.timeframe)
                .cloned()
                .collect();
            if rows.is_empty() {
                continue;
            }
            rows.iter().for_each(|c| state.absorb(c));
            state.report.written += self.store.upsert_candles(&rows)?;
        }
        Ok(())
    }
}

/// Widen `[start, end)` outward so every target's first and last bucket is
/// read in full.
fn widen(targets: &[Timeframe], start: i64, end: i64) -> TimeRange {
    let lo = targets.iter().map(|t| t.floor(start)).min().unwrap_or(start);
    let hi = targets.iter().map(|t| t.ceil(end)).max().unwrap_or(end);
    TimeRange::new(lo, hi)
}
