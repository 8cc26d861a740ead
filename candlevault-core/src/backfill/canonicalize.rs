//! Canonicalize a fetched window: clip, validate, sort, dedupe.
//!
//! Adapters are untrusted. Anything outside the requested window, for a
//! different series, or breaking the OHLCV invariants is discarded and
//! reported as a [`DataIntegrityWarning`]; nothing here is fatal.

use crate::domain::{Candle, CandleError, SeriesKey, TimeRange};
use crate::timeframe::Timeframe;
use serde::Serialize;

/// A fetched row that was dropped before the write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataIntegrityWarning {
    /// Open time outside the requested window.
    OutOfWindow { open_time_ms: i64 },
    /// Venue, symbol or timeframe differs from the request.
    ForeignSeries { open_time_ms: i64 },
    /// Breaks the OHLCV invariants.
    Invalid { reason: CandleError },
    /// Second row for an open time already seen; the first one wins.
    Duplicate { open_time_ms: i64 },
}

#[derive(Debug, Default)]
pub struct CanonicalWindow {
    pub rows: Vec<Candle>,
    pub warnings: Vec<DataIntegrityWarning>,
}

pub fn canonicalize_window(
    key: &SeriesKey,
    timeframe: Timeframe,
    window: TimeRange,
    fetched: Vec<Candle>,
) -> CanonicalWindow {
    let mut out = CanonicalWindow::default();

    for candle in fetched {
        let open_time_ms = candle.open_time_ms;
        if candle.venue != key.venue || candle.symbol != key.symbol || candle.timeframe != timeframe
        {
            out.warnings.push(DataIntegrityWarning::ForeignSeries { open_time_ms });
        } else if !window.contains(open_time_ms) {
            out.warnings.push(DataIntegrityWarning::OutOfWindow { open_time_ms });
        } else if let Err(reason) = candle.validate() {
            out.warnings.push(DataIntegrityWarning::Invalid { reason });
        } else {
            out.rows.push(candle);
        }
    }

    // stable sort keeps first-seen order among equal open times
    out.rows.sort_by_key(|c| c.open_time_ms);
    let before = std::mem::take(&mut out.rows);
    for candle in before {
        match out.rows.last() {
            Some(last) if last.open_time_ms == candle.open_time_ms => {
                out.warnings.push(DataIntegrityWarning::Duplicate {
                    open_time_ms: candle.open_time_ms,
                });
            }
            _ => out.rows.push(candle),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframe::ONE_MINUTE;
    use crate::venue::mock::synthetic_candle;

    const MIN: i64 = 60_000;

    fn key() -> SeriesKey {
        SeriesKey::new("mock", "BTC/USDT")
    }

    fn candle(ts: i64) -> Candle {
        synthetic_candle("mock", "BTC/USDT", ONE_MINUTE, ts)
    }

    #[test]
    fn clean_window_passes_through_sorted() {
        let window = TimeRange::new(0, 3 * MIN);
        let out = canonicalize_window(&key(), ONE_MINUTE, window, vec![candle(2 * MIN), candle(0), candle(MIN)]);
        let times: Vec<i64> = out.rows.iter().map(|c| c.open_time_ms).collect();
        assert_eq!(times, vec![0, MIN, 2 * MIN]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn stray_rows_are_clipped() {
        let window = TimeRange::new(MIN, 2 * MIN);
        let out = canonicalize_window(&key(), ONE_MINUTE, window, vec![candle(0), candle(MIN), candle(2 * MIN)]);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(
            out.warnings,
            vec![
                DataIntegrityWarning::OutOfWindow { open_time_ms: 0 },
                DataIntegrityWarning::OutOfWindow { open_time_ms: 2 * MIN },
            ]
        );
    }

    #[test]
    fn duplicates_keep_the_first_row() {
        let window = TimeRange::new(0, 2 * MIN);
        let mut revised = candle(0);
        revised.close += 0.1;
        revised.high += 0.1;
        let out = canonicalize_window(&key(), ONE_MINUTE, window, vec![candle(0), revised]);
        assert_eq!(out.rows, vec![candle(0)]);
        assert_eq!(out.warnings, vec![DataIntegrityWarning::Duplicate { open_time_ms: 0 }]);
    }

    #[test]
    fn invalid_and_foreign_rows_are_discarded() {
        let window = TimeRange::new(0, 3 * MIN);
        let mut bad = candle(MIN);
        bad.volume = -1.0;
        let mut foreign = candle(2 * MIN);
        foreign.symbol = "ETH/USDT".into();
        let mut misaligned = candle(0);
        misaligned.open_time_ms = 30_000;

        let out = canonicalize_window(&key(), ONE_MINUTE, window, vec![bad, foreign, misaligned]);
        assert!(out.rows.is_empty());
        assert_eq!(out.warnings.len(), 3);
        assert!(matches!(
            out.warnings[0],
            DataIntegrityWarning::Invalid { reason: CandleError::NegativeVolume { .. } }
        ));
        assert!(matches!(out.warnings[1], DataIntegrityWarning::ForeignSeries { .. }));
        assert!(matches!(
            out.warnings[2],
            DataIntegrityWarning::Invalid { reason: CandleError::Misaligned { .. } }
        ));
    }
}
