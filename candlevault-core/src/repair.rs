//! Gap repair: find holes in the stored base series and re-fetch them.
//!
//! Coverage says a span was fetched, not that the venue had every minute.
//! Venues sometimes backfill their own outages later, so holes inside
//! covered ranges are worth re-asking for. Repair only upserts candles; it
//! never changes coverage.

use crate::backfill::{canonicalize_window, RetryOutcome, RetryPolicy};
use crate::domain::{SeriesKey, TimeRange};
use crate::store::{CandleStore, StoreError};
use crate::timeframe::Timeframe;
use crate::venue::{FetchError, VenueRegistry};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Base rows are scanned this many days at a time.
const SCAN_CHUNK_MS: i64 = 7 * 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRepairConfig {
    /// Gaps longer than this are reported but not fetched.
    pub max_gap_minutes: u32,
    /// Fetch window size.
    pub chunk_minutes: u32,
    /// Stop scanning after this many gaps.
    pub max_ranges: usize,
}

impl Default for GapRepairConfig {
    fn default() -> Self {
        Self {
            max_gap_minutes: 60 * 24 * 14,
            chunk_minutes: 1000,
            max_ranges: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid repair settings: {0}")]
    InvalidConfig(String),
}

/// Missing base buckets inside the covered part of `scan`, ascending, at
/// most `max_ranges` of them.
pub fn find_gaps(
    store: &dyn CandleStore,
    key: &SeriesKey,
    base: Timeframe,
    scan: TimeRange,
    max_ranges: usize,
) -> Result<Vec<TimeRange>, StoreError> {
    let mut gaps = Vec::new();
    let step = base.duration_ms();

    for covered in store.coverage_ranges(key, base)? {
        let Some(span) = covered.intersect(&scan) else {
            continue;
        };
        let span = TimeRange::new(base.ceil(span.start_ms), base.floor(span.end_ms));
        let mut expected = span.start_ms;

        for chunk in span.split(SCAN_CHUNK_MS) {
            for candle in store.read_candles(key, base, chunk)? {
                if candle.open_time_ms > expected {
                    gaps.push(TimeRange::new(expected, candle.open_time_ms));
                    if gaps.len() >= max_ranges {
                        return Ok(gaps);
                    }
                }
                expected = candle.open_time_ms + step;
            }
        }
        if expected < span.end_ms {
            gaps.push(TimeRange::new(expected, span.end_ms));
            if gaps.len() >= max_ranges {
                return Ok(gaps);
            }
        }
    }
    Ok(gaps)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub gaps_found: Vec<TimeRange>,
    /// Gaps over the size limit, left alone.
    pub skipped: Vec<TimeRange>,
    pub attempted: usize,
    pub fetched: usize,
    pub written: usize,
    /// Windows that could not be fetched, with the error text.
    pub failed: Vec<(TimeRange, String)>,
    pub cancelled: bool,
}

impl RepairReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

pub struct GapRepair {
    store: Arc<dyn CandleStore>,
    venues: VenueRegistry,
    base: Timeframe,
    config: GapRepairConfig,
    retry: RetryPolicy,
    cancel: Arc<AtomicBool>,
}

impl GapRepair {
    pub fn new(
        store: Arc<dyn CandleStore>,
        venues: VenueRegistry,
        base: Timeframe,
        config: GapRepairConfig,
    ) -> Self {
        Self {
            store,
            venues,
            base,
            config,
            retry: RetryPolicy::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, key: &SeriesKey, scan: TimeRange) -> Result<RepairReport, RepairError> {
        if self.config.chunk_minutes == 0 || self.config.max_ranges == 0 {
            return Err(RepairError::InvalidConfig(
                "chunk_minutes and max_ranges must be positive".into(),
            ));
        }
        let fetcher = self.venues.get(&key.venue)?;
        let mut report = RepairReport {
            gaps_found: find_gaps(self.store.as_ref(), key, self.base, scan, self.config.max_ranges)?,
            ..RepairReport::default()
        };
        if report.gaps_found.is_empty() {
            info!(series = %key, %scan, "no gaps found");
            return Ok(report);
        }
        warn!(series = %key, gaps = report.gaps_found.len(), "found gaps in base series");

        let max_gap_ms = i64::from(self.config.max_gap_minutes) * self.base.duration_ms();
        let chunk_ms = i64::from(self.config.chunk_minutes) * self.base.duration_ms();

        for gap in report.gaps_found.clone() {
            if gap.len_ms() > max_gap_ms {
                warn!(series = %key, %gap, "gap exceeds max_gap_minutes, skipping");
                report.skipped.push(gap);
                continue;
            }
            report.attempted += 1;

            for window in gap.split(chunk_ms) {
                if self.cancel.load(Ordering::SeqCst) {
                    report.cancelled = true;
                    return Ok(report);
                }
                let fetched = match self
                    .retry
                    .run(&self.cancel, |_| fetcher.fetch(&key.symbol, self.base, window))
                {
                    RetryOutcome::Succeeded { value, .. } => value,
                    RetryOutcome::Cancelled { .. } => {
                        report.cancelled = true;
                        return Ok(report);
                    }
                    RetryOutcome::Failed { error, .. } => {
                        warn!(series = %key, %window, %error, "gap window fetch failed");
                        report.failed.push((window, error.to_string()));
                        if !error.is_retryable() {
                            return Ok(report);
                        }
                        continue;
                    }
                };

                report.fetched += fetched.len();
                let canonical = canonicalize_window(key, self.base, window, fetched);
                if canonical.rows.is_empty() {
                    warn!(series = %key, %window, "venue still has no candles for gap window");
                    continue;
                }
                let written = self.store.upsert_candles(&canonical.rows)?;
                info!(series = %key, %window, rows = canonical.rows.len(), written, "gap window repaired");
                report.written += written;
            }
        }
        Ok(report)
    }
}
