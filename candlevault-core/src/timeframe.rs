//! Fixed-duration candle intervals.
//!
//! A timeframe is a positive number of milliseconds with a canonical label
//! (`1m`, `5m`, `1h`, `4h`, `1d`, ...). Buckets are aligned to epoch zero,
//! so a `4h` bucket always opens at 00/04/08/12/16/20 UTC regardless of
//! where a request starts.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Units ordered from coarsest to finest, used to pick the canonical label.
const UNITS: [(char, i64); 5] = [
    ('w', WEEK_MS),
    ('d', DAY_MS),
    ('h', HOUR_MS),
    ('m', MINUTE_MS),
    ('s', SECOND_MS),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeframeError {
    #[error("invalid timeframe '{0}' (expected e.g. '1m', '5m', '1h')")]
    Invalid(String),

    #[error("timeframe {target} is not a whole multiple of base timeframe {base}")]
    NotMultiple { target: Timeframe, base: Timeframe },
}

/// A fixed bucket duration in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeframe {
    ms: i64,
}

/// The base resolution that backfill fetches and aggregation consumes.
pub const ONE_MINUTE: Timeframe = Timeframe { ms: MINUTE_MS };

impl Timeframe {
    pub fn from_ms(ms: i64) -> Result<Self, TimeframeError> {
        if ms <= 0 || ms % SECOND_MS != 0 {
            return Err(TimeframeError::Invalid(format!("{ms}ms")));
        }
        Ok(Self { ms })
    }

    /// Parse a label of the form `<n><unit>` where unit is one of `s m h d w`.
    pub fn parse(label: &str) -> Result<Self, TimeframeError> {
        let s = label.trim();
        let invalid = || TimeframeError::Invalid(label.to_string());

        let unit = s.chars().last().ok_or_else(invalid)?;
        let digits = &s[..s.len() - unit.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        let mult = UNITS
            .iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, ms)| *ms)
            .ok_or_else(invalid)?;

        let ms = n.checked_mul(mult).ok_or_else(invalid)?;
        Self::from_ms(ms).map_err(|_| invalid())
    }

    /// Parse a comma-separated list such as `5m,15m,1h,4h`. Empty items are ignored.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, TimeframeError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn duration_ms(&self) -> i64 {
        self.ms
    }

    /// Canonical label using the coarsest unit that divides the duration evenly.
    pub fn label(&self) -> String {
        for (unit, unit_ms) in UNITS {
            if self.ms % unit_ms == 0 {
                return format!("{}{unit}", self.ms / unit_ms);
            }
        }
        // from_ms guarantees whole seconds
        format!("{}s", self.ms / SECOND_MS)
    }

    /// Left edge of the bucket containing `ts_ms`.
    pub fn floor(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.ms) * self.ms
    }

    /// Smallest bucket edge that is `>= ts_ms`.
    pub fn ceil(&self, ts_ms: i64) -> i64 {
        let floored = self.floor(ts_ms);
        if floored == ts_ms {
            ts_ms
        } else {
            floored + self.ms
        }
    }

    pub fn is_aligned(&self, ts_ms: i64) -> bool {
        ts_ms.rem_euclid(self.ms) == 0
    }

    /// True if this timeframe is a positive whole multiple of `base`.
    pub fn is_multiple_of(&self, base: Timeframe) -> bool {
        self.ms % base.ms == 0
    }

    /// Number of `base` buckets inside one bucket of `self`.
    pub fn buckets_of(&self, base: Timeframe) -> Result<i64, TimeframeError> {
        if !self.is_multiple_of(base) {
            return Err(TimeframeError::NotMultiple { target: *self, base });
        }
        Ok(self.ms / base.ms)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timeframe::parse(&s).map_err(serde::de::Error::custom)
    }
}
