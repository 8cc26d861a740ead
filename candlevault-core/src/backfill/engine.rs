//! Backfill orchestrator: coverage diff → windows → fetch → commit.

use super::canonicalize::{canonicalize_window, DataIntegrityWarning};
use super::progress::BackfillProgress;
use super::retry::{RetryOutcome, RetryPolicy};
use super::BackfillError;
use crate::clock::{Clock, EndBound, SystemClock};
use crate::coverage::{coalesce, missing_ranges};
use crate::domain::{SeriesKey, TimeRange};
use crate::store::{CandleStore, CoverageUpdate};
use crate::timeframe::{Timeframe, ONE_MINUTE};
use crate::venue::{VenueFetcher, VenueRegistry};
use rayon::prelude::*;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DAY_MS: i64 = 86_400_000;

/// What to backfill for one (venue, symbol) series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillRequest {
    pub key: SeriesKey,
    pub base_timeframe: Timeframe,
    pub start_ms: i64,
    pub end: EndBound,
    pub chunk_days: u32,
}

impl BackfillRequest {
    /// One-minute base, 7-day windows, open-ended.
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>, start_ms: i64) -> Self {
        Self {
            key: SeriesKey::new(venue, symbol),
            base_timeframe: ONE_MINUTE,
            start_ms,
            end: EndBound::Now,
            chunk_days: 7,
        }
    }

    pub fn with_end(mut self, end: EndBound) -> Self {
        self.end = end;
        self
    }

    pub fn with_chunk_days(mut self, chunk_days: u32) -> Self {
        self.chunk_days = chunk_days;
        self
    }

    pub fn with_base_timeframe(mut self, base_timeframe: Timeframe) -> Self {
        self.base_timeframe = base_timeframe;
        self
    }
}

/// The resolved work for one run, before any fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillPlan {
    /// `[start, end)` after flooring both to the base timeframe and
    /// clamping the end to now.
    pub requested: TimeRange,
    pub missing: Vec<TimeRange>,
    pub windows: Vec<TimeRange>,
    /// The end was taken from the clock, so the last window touches "now".
    pub open_ended: bool,
}

impl BackfillPlan {
    pub fn is_trailing(&self, window: &TimeRange) -> bool {
        self.open_ended && window.end_ms == self.requested.end_ms
    }
}

/// Result of one committed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub range: TimeRange,
    /// Rows the adapter returned, before canonicalization.
    pub fetched: usize,
    /// Rows actually inserted or changed in the store.
    pub written: usize,
    /// Coverage advanced by this window, if any.
    pub covered: Option<TimeRange>,
    /// No usable candles came back for this window.
    pub zero_rows: bool,
    pub trailing: bool,
    pub attempts: u32,
    pub warnings: Vec<DataIntegrityWarning>,
}

#[derive(Debug)]
pub enum BackfillOutcome {
    Completed,
    /// Stopped at a window boundary on request.
    Cancelled,
    Failed(BackfillError),
}

impl Serialize for BackfillOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("BackfillOutcome", 2)?;
        match self {
            BackfillOutcome::Completed => {
                s.serialize_field("status", "completed")?;
                s.serialize_field("error", &None::<String>)?;
            }
            BackfillOutcome::Cancelled => {
                s.serialize_field("status", "cancelled")?;
                s.serialize_field("error", &None::<String>)?;
            }
            BackfillOutcome::Failed(err) => {
                s.serialize_field("status", "failed")?;
                s.serialize_field("error", &Some(err.to_string()))?;
            }
        }
        s.end()
    }
}

/// Per-series summary: what was committed and what is left to re-run.
#[derive(Debug, Serialize)]
pub struct BackfillReport {
    pub key: SeriesKey,
    pub base_timeframe: Timeframe,
    pub requested: TimeRange,
    pub windows: Vec<WindowReport>,
    /// Windows not committed because the run failed or was cancelled.
    pub remaining: Vec<TimeRange>,
    pub outcome: BackfillOutcome,
}

impl BackfillReport {
    fn new(key: SeriesKey, base_timeframe: Timeframe, requested: TimeRange) -> Self {
        Self {
            key,
            base_timeframe,
            requested,
            windows: Vec::new(),
            remaining: Vec::new(),
            outcome: BackfillOutcome::Completed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BackfillOutcome::Completed)
    }

    pub fn error(&self) -> Option<&BackfillError> {
        match &self.outcome {
            BackfillOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn rows_written(&self) -> usize {
        self.windows.iter().map(|w| w.written).sum()
    }

    /// Coverage added by this run, coalesced.
    pub fn committed(&self) -> Vec<TimeRange> {
        coalesce(self.windows.iter().filter_map(|w| w.covered).collect())
    }

    /// Windows recorded as upstream gaps.
    pub fn zero_row_windows(&self) -> Vec<TimeRange> {
        self.windows
            .iter()
            .filter(|w| w.zero_rows)
            .map(|w| w.range)
            .collect()
    }

    pub fn warning_count(&self) -> usize {
        self.windows.iter().map(|w| w.warnings.len()).sum()
    }
}

enum WindowFailure {
    Cancelled,
    Failed(BackfillError),
}

pub struct BackfillEngine {
    store: Arc<dyn CandleStore>,
    venues: VenueRegistry,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    cancel: Arc<AtomicBool>,
}

impl BackfillEngine {
    pub fn new(store: Arc<dyn CandleStore>, venues: VenueRegistry) -> Self {
        Self {
            store,
            venues,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a cancellation flag (e.g. set from a Ctrl-C handler).
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Resolve the request against the clock and current coverage.
    ///
    /// "Now" is read here, on every call, never cached on the engine.
    pub fn plan(&self, req: &BackfillRequest) -> Result<BackfillPlan, BackfillError> {
        if req.chunk_days == 0 {
            return Err(BackfillError::InvalidRequest("chunk_days must be at least 1".into()));
        }
        let tf = req.base_timeframe;
        let now = self.clock.now_ms();
        let open_ended = match req.end {
            EndBound::Now => true,
            EndBound::At(ms) => ms >= now,
        };
        let start = tf.floor(req.start_ms);
        let end = tf.floor(req.end.resolve(self.clock.as_ref()));
        let requested = TimeRange::new(start, end.max(start));

        let coverage = self.store.coverage_ranges(&req.key, tf)?;
        let missing = missing_ranges(&coverage, requested.start_ms, requested.end_ms);
        let chunk_ms = i64::from(req.chunk_days) * DAY_MS;
        let windows = missing.iter().flat_map(|r| r.split(chunk_ms)).collect();

        Ok(BackfillPlan {
            requested,
            missing,
            windows,
            open_ended,
        })
    }

    /// Backfill one series. Never panics on fetch or store failure; the
    /// outcome and the uncommitted remainder are in the report.
    pub fn run(&self, req: &BackfillRequest, progress: &dyn BackfillProgress) -> BackfillReport {
        let mut report = BackfillReport::new(
            req.key.clone(),
            req.base_timeframe,
            TimeRange::new(req.start_ms, req.start_ms),
        );

        let plan = match self.plan(req) {
            Ok(plan) => plan,
            Err(err) => {
                report.outcome = BackfillOutcome::Failed(err);
                progress.on_finish(&report);
                return report;
            }
        };
        report.requested = plan.requested;
        progress.on_plan(&req.key, &plan.missing, plan.windows.len());

        if plan.windows.is_empty() {
            debug!(series = %req.key, requested = %plan.requested, "already covered");
            progress.on_finish(&report);
            return report;
        }

        let fetcher = match self.venues.get(&req.key.venue) {
            Ok(fetcher) => fetcher,
            Err(source) => {
                report.remaining = plan.missing.clone();
                report.outcome = BackfillOutcome::Failed(BackfillError::Fetch {
                    window: plan.requested,
                    attempts: 0,
                    source,
                });
                progress.on_finish(&report);
                return report;
            }
        };

        let total = plan.windows.len();
        for (i, window) in plan.windows.iter().enumerate() {
            if self.is_cancelled() {
                report.remaining = coalesce(plan.windows[i..].to_vec());
                report.outcome = BackfillOutcome::Cancelled;
                break;
            }

            match self.backfill_window(fetcher.as_ref(), req, *window, plan.is_trailing(window)) {
                Ok(window_report) => {
                    progress.on_window(&req.key, i, total, &window_report);
                    report.windows.push(window_report);
                }
                Err(failure) => {
                    report.remaining = coalesce(plan.windows[i..].to_vec());
                    report.outcome = match failure {
                        WindowFailure::Cancelled => BackfillOutcome::Cancelled,
                        WindowFailure::Failed(err) => BackfillOutcome::Failed(err),
                    };
                    break;
                }
            }
        }

        progress.on_finish(&report);
        report
    }

    /// Backfill independent series in parallel. Each series still runs its
    /// windows strictly in order; one series failing never stops another.
    /// Reports come back in request order.
    pub fn run_many(
        &self,
        requests: &[BackfillRequest],
        progress: &dyn BackfillProgress,
    ) -> Vec<BackfillReport> {
        requests
            .par_iter()
            .map(|req| self.run(req, progress))
            .collect()
    }

    fn backfill_window(
        &self,
        fetcher: &dyn VenueFetcher,
        req: &BackfillRequest,
        window: TimeRange,
        trailing: bool,
    ) -> Result<WindowReport, WindowFailure> {
        let key = &req.key;
        let tf = req.base_timeframe;

        let outcome = self.retry.run(&self.cancel, |attempt| {
            debug!(series = %key, %window, attempt, "fetching window");
            fetcher.fetch(&key.symbol, tf, window)
        });
        let (fetched, attempts) = match outcome {
            RetryOutcome::Succeeded { value, attempts } => (value, attempts),
            RetryOutcome::Failed { error, attempts } => {
                return Err(WindowFailure::Failed(BackfillError::Fetch {
                    window,
                    attempts,
                    source: error,
                }))
            }
            RetryOutcome::Cancelled { .. } => return Err(WindowFailure::Cancelled),
        };

        let fetched_count = fetched.len();
        let canonical = canonicalize_window(key, tf, window, fetched);
        for warning in &canonical.warnings {
            warn!(series = %key, %window, ?warning, "discarded fetched row");
        }

        // The trailing window only counts as covered up to the last candle the
        // venue actually produced; the rest is retried on the next run.
        let covered = if trailing {
            canonical
                .rows
                .last()
                .map(|c| TimeRange::new(window.start_ms, c.close_time_ms().min(window.end_ms)))
        } else {
            Some(window)
        };
        let update = covered.map(|range| CoverageUpdate {
            key: key.clone(),
            base_timeframe: tf,
            range,
        });

        let written = self
            .store
            .commit_window(&canonical.rows, update.as_ref())
            .map_err(|e| WindowFailure::Failed(BackfillError::Store(e)))?;

        let zero_rows = canonical.rows.is_empty();
        if zero_rows && !trailing {
            warn!(series = %key, %window, "venue returned no candles, recording window as upstream gap");
        }
        if trailing && covered != Some(window) {
            let held_from = covered.map_or(window.start_ms, |r| r.end_ms);
            info!(
                series = %key,
                held_from = %crate::clock::format_timestamp_ms(held_from),
                "trailing window held open until the venue closes it"
            );
        }

        Ok(WindowReport {
            range: window,
            fetched: fetched_count,
            written,
            covered,
            zero_rows,
            trailing,
            attempts,
            warnings: canonical.warnings,
        })
    }
}
