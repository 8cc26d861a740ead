//! Half-open time ranges and coverage records.

use crate::clock::format_timestamp_ms;
use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open interval `[start_ms, end_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn len_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end_ms <= self.start_ms
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        self.start_ms <= ts_ms && ts_ms < self.end_ms
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start_ms <= other.start_ms && other.end_ms <= self.end_ms
    }

    /// True if the two ranges overlap or share an edge, i.e. their union is
    /// one contiguous range.
    pub fn overlaps_or_touches(&self, other: &TimeRange) -> bool {
        self.start_ms <= other.end_ms && other.start_ms <= self.end_ms
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let r = TimeRange::new(
            self.start_ms.max(other.start_ms),
            self.end_ms.min(other.end_ms),
        );
        (!r.is_empty()).then_some(r)
    }

    /// Split into sequential windows no longer than `chunk_ms`, earliest first.
    /// The last window is truncated to the range end.
    pub fn split(&self, chunk_ms: i64) -> Vec<TimeRange> {
        let chunk_ms = chunk_ms.max(1);
        let mut out = Vec::new();
        let mut cursor = self.start_ms;
        while cursor < self.end_ms {
            let next = cursor.saturating_add(chunk_ms).min(self.end_ms);
            out.push(TimeRange::new(cursor, next));
            cursor = next;
        }
        out
    }

    /// Widen outward to `timeframe` bucket edges.
    pub fn align_outward(&self, timeframe: Timeframe) -> TimeRange {
        TimeRange::new(timeframe.floor(self.start_ms), timeframe.ceil(self.end_ms))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{})",
            format_timestamp_ms(self.start_ms),
            format_timestamp_ms(self.end_ms)
        )
    }
}

/// A contiguous, gapless, already-persisted span of base candles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub venue: String,
    pub symbol: String,
    pub base_timeframe: Timeframe,
    pub range: TimeRange,
}
