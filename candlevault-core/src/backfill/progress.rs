use super::engine::{BackfillOutcome, BackfillReport, WindowReport};
use crate::domain::{SeriesKey, TimeRange};
use tracing::{info, warn};

/// Progress callback for backfill runs.
///
/// Called from worker threads when several pairs run in parallel, hence
/// `Sync`.
pub trait BackfillProgress: Send + Sync {
    /// Called once the missing ranges and windows for a pair are known.
    fn on_plan(&self, key: &SeriesKey, missing: &[TimeRange], windows: usize);

    /// Called after each window is committed (or skipped).
    fn on_window(&self, key: &SeriesKey, index: usize, total: usize, window: &WindowReport);

    /// Called when a pair's run ends, whatever the outcome.
    fn on_finish(&self, report: &BackfillReport);
}

/// Reports progress as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl BackfillProgress for TracingProgress {
    fn on_plan(&self, key: &SeriesKey, missing: &[TimeRange], windows: usize) {
        info!(series = %key, missing = missing.len(), windows, "backfill plan");
    }

    fn on_window(&self, key: &SeriesKey, index: usize, total: usize, window: &WindowReport) {
        info!(
            series = %key,
            window = %window.range,
            index = index + 1,
            total,
            fetched = window.fetched,
            written = window.written,
            discarded = window.warnings.len(),
            "window committed"
        );
    }

    fn on_finish(&self, report: &BackfillReport) {
        match &report.outcome {
            BackfillOutcome::Completed => info!(
                series = %report.key,
                windows = report.windows.len(),
                rows = report.rows_written(),
                "backfill complete"
            ),
            BackfillOutcome::Cancelled => warn!(
                series = %report.key,
                remaining = report.remaining.len(),
                "backfill cancelled"
            ),
            BackfillOutcome::Failed(err) => warn!(
                series = %report.key,
                remaining = report.remaining.len(),
                error = %err,
                "backfill failed"
            ),
        }
    }
}

/// Discards every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl BackfillProgress for SilentProgress {
    fn on_plan(&self, _key: &SeriesKey, _missing: &[TimeRange], _windows: usize) {}
    fn on_window(&self, _key: &SeriesKey, _index: usize, _total: usize, _window: &WindowReport) {}
    fn on_finish(&self, _report: &BackfillReport) {}
}
