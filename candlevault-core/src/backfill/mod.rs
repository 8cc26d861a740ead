//! Coverage-tracked backfill.
//!
//! Fills exactly the missing time for a (venue, symbol) series in bounded,
//! chronological windows. Each window's candles and its coverage advance
//! commit together, so an interrupted run resumes where it stopped.

pub mod canonicalize;
pub mod engine;
pub mod progress;
pub mod retry;

pub use canonicalize::{canonicalize_window, DataIntegrityWarning};
pub use engine::{
    BackfillEngine, BackfillOutcome, BackfillReport, BackfillRequest, WindowReport,
};
pub use progress::{BackfillProgress, SilentProgress, TracingProgress};
pub use retry::{RetryOutcome, RetryPolicy};

use crate::domain::TimeRange;
use crate::store::StoreError;
use crate::venue::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackfillError {
    /// Permanent failure, or transient failure after the retry budget.
    #[error("fetch failed for {window} after {attempts} attempt(s): {source}")]
    Fetch {
        window: TimeRange,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// Fatal for the run: coverage stays at the last committed window.
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),

    #[error("invalid backfill request: {0}")]
    InvalidRequest(String),
}

impl BackfillError {
    /// True if re-running later may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackfillError::Fetch { source, .. } => source.is_retryable(),
            BackfillError::Store(_) => true,
            BackfillError::InvalidRequest(_) => false,
        }
    }
}
