//! Time-series store: idempotent keyed candle storage plus coverage metadata.
//!
//! The store is the serialization point for every writer (backfill, live
//! ingestion, aggregation). Candle upserts and coverage merges for one
//! window commit in a single transaction, so coverage can never claim a
//! range whose rows were not written.

pub mod schema;
pub mod sqlite;

pub use schema::TableMap;
pub use sqlite::SqliteStore;

use crate::domain::{Candle, CandleError, CoverageRecord, SeriesKey, TimeRange};
use crate::timeframe::{Timeframe, TimeframeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rejected batch: {symbol} {timeframe} {source}")]
    InvalidCandle {
        symbol: String,
        timeframe: Timeframe,
        #[source]
        source: CandleError,
    },

    #[error(transparent)]
    Schema(#[from] schema::SchemaError),

    #[error("corrupt coverage row: {0}")]
    CorruptCoverage(#[from] TimeframeError),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store write failed: {0}")]
    Other(String),
}

/// Coverage to merge together with a candle batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageUpdate {
    pub key: SeriesKey,
    pub base_timeframe: Timeframe,
    pub range: TimeRange,
}

/// Storage contract shared by backfill, aggregation and live ingestion.
pub trait CandleStore: Send + Sync {
    /// Idempotent keyed write. Identical rows are no-ops; differing rows for
    /// an existing key overwrite it. All-or-nothing per batch. Returns the
    /// number of rows actually inserted or changed.
    fn upsert_candles(&self, rows: &[Candle]) -> Result<usize, StoreError> {
        self.commit_window(rows, None)
    }

    /// Rows with `open_time_ms` in `range`, ascending.
    fn read_candles(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError>;

    /// Current sorted, non-overlapping, non-adjacent coverage set.
    fn get_coverage(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
    ) -> Result<Vec<CoverageRecord>, StoreError>;

    /// Insert `new_range` and coalesce it with adjacent or overlapping
    /// records. Returns the resulting set.
    fn merge_coverage(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
        new_range: TimeRange,
    ) -> Result<Vec<CoverageRecord>, StoreError>;

    /// Upsert `rows` and merge `coverage` in one transaction.
    fn commit_window(
        &self,
        rows: &[Candle],
        coverage: Option<&CoverageUpdate>,
    ) -> Result<usize, StoreError>;

    /// `(min, max)` open time stored for a series, if any rows exist.
    fn time_bounds(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
    ) -> Result<Option<(i64, i64)>, StoreError>;

    /// Every series with at least one coverage record for `base_timeframe`.
    fn list_series(&self, base_timeframe: Timeframe) -> Result<Vec<SeriesKey>, StoreError>;

    /// Highest open time written for a series. For a derived timeframe this
    /// is the aggregation cursor.
    fn latest_open_time(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.time_bounds(key, timeframe)?.map(|(_, max)| max))
    }

    /// Coverage as plain ranges.
    fn coverage_ranges(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
    ) -> Result<Vec<TimeRange>, StoreError> {
        Ok(self
            .get_coverage(key, base_timeframe)?
            .into_iter()
            .map(|r| r.range)
            .collect())
    }
}

/// Reject the whole batch if any row breaks the candle invariants.
pub(crate) fn validate_batch(rows: &[Candle]) -> Result<(), StoreError> {
    for row in rows {
        row.validate().map_err(|source| StoreError::InvalidCandle {
            symbol: row.symbol.clone(),
            timeframe: row.timeframe,
            source,
        })?;
    }
    Ok(())
}
