//! Wall-clock abstraction.
//!
//! "Now" is a function of call time, never a cached value: every backfill or
//! aggregation pass asks the clock again so repeated runs pick up newly
//! elapsed time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds (UTC).
    fn now_ms(&self) -> i64;
}

/// The real UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// End of a requested span: a fixed instant, or whatever "now" is when the
/// span is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndBound {
    At(i64),
    Now,
}

impl EndBound {
    pub fn from_option(end_ms: Option<i64>) -> Self {
        end_ms.map_or(EndBound::Now, EndBound::At)
    }

    /// Resolve against the clock. A fixed end in the future is clamped to now.
    pub fn resolve(&self, clock: &dyn Clock) -> i64 {
        let now = clock.now_ms();
        match *self {
            EndBound::At(ms) => ms.min(now),
            EndBound::Now => now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timestamp '{0}' (expected RFC 3339, 'YYYY-MM-DDTHH:MM:SS' or 'YYYY-MM-DD')")]
pub struct TimestampParseError(pub String);

/// Parse an ISO 8601 / RFC 3339 timestamp into epoch milliseconds.
///
/// Accepts `2017-08-17T00:00:00Z`, `2017-08-17T00:00:00+02:00`, a naive
/// `2017-08-17T00:00:00` (taken as UTC) and a bare date `2017-08-17`.
pub fn parse_timestamp_ms(s: &str) -> Result<i64, TimestampParseError> {
    let trimmed = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(TimestampParseError(s.to_string()))
}

/// Format epoch milliseconds as `2023-11-14T22:13:20Z`.
pub fn format_timestamp_ms(ts_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ts_ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => format!("{ts_ms}ms"),
    }
}
