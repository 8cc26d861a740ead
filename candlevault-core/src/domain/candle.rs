//! Candle — the fundamental market data unit.

use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A (venue, symbol) pair. Every series in the store is keyed by one of
/// these plus a timeframe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub venue: String,
    pub symbol: String,
}

impl SeriesKey {
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.venue, self.symbol)
    }
}

/// OHLCV candle for one bucket of one series.
///
/// `open_time_ms` is the left edge of the bucket and is always a multiple of
/// the timeframe's duration. Unique key: (venue, symbol, timeframe, open_time_ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub venue: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandleError {
    #[error("non-finite price or volume at {open_time_ms}")]
    NonFinite { open_time_ms: i64 },

    #[error("high/low do not bracket open/close at {open_time_ms}")]
    InvertedRange { open_time_ms: i64 },

    #[error("negative volume at {open_time_ms}")]
    NegativeVolume { open_time_ms: i64 },

    #[error("open time {open_time_ms} is not aligned to {timeframe}")]
    Misaligned { open_time_ms: i64, timeframe: Timeframe },
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.venue.clone(), self.symbol.clone())
    }

    /// Exclusive right edge of the bucket.
    pub fn close_time_ms(&self) -> i64 {
        self.open_time_ms + self.timeframe.duration_ms()
    }

    /// Check the OHLCV invariants: finite values, `high >= max(open, close)`,
    /// `low <= min(open, close)`, `volume >= 0`, epoch-aligned open time.
    pub fn validate(&self) -> Result<(), CandleError> {
        let open_time_ms = self.open_time_ms;
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CandleError::NonFinite { open_time_ms });
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return Err(CandleError::InvertedRange { open_time_ms });
        }
        if self.volume < 0.0 {
            return Err(CandleError::NegativeVolume { open_time_ms });
        }
        if !self.timeframe.is_aligned(open_time_ms) {
            return Err(CandleError::Misaligned {
                open_time_ms,
                timeframe: self.timeframe,
            });
        }
        Ok(())
    }

    pub fn is_sane(&self) -> bool {
        self.validate().is_ok()
    }

    /// True if the OHLCV payload is bit-identical to `other`'s.
    pub fn same_values(&self, other: &Candle) -> bool {
        self.open.to_bits() == other.open.to_bits()
            && self.high.to_bits() == other.high.to_bits()
            && self.low.to_bits() == other.low.to_bits()
            && self.close.to_bits() == other.close.to_bits()
            && self.volume.to_bits() == other.volume.to_bits()
    }
}
