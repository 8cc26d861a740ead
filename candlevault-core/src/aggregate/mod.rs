//! Multi-timeframe aggregation of the base series.

pub mod aggregator;
pub mod engine;

pub use aggregator::{aggregate_all, Aggregator, GapDetected, HeldBucket, HoldReason};
pub use engine::{AggregateReport, AggregateRequest, AggregationEngine, TimeframeReport};

use crate::store::StoreError;
use crate::timeframe::TimeframeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Timeframe(#[from] TimeframeError),

    #[error("no target timeframes left after removing the base timeframe")]
    NoTargets,

    #[error("store error during aggregation: {0}")]
    Store(#[from] StoreError),

    #[error("invalid aggregation request: {0}")]
    InvalidRequest(String),

    #[error("aggregation cancelled")]
    Cancelled,
}
