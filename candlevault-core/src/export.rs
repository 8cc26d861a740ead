//! CSV export of stored candles.
//!
//! Reads the series in bounded chunks and streams rows to any writer in
//! ascending open time: the ordered, read-only feed a backtester consumes.

use crate::clock::format_timestamp_ms;
use crate::domain::{SeriesKey, TimeRange};
use crate::store::{CandleStore, StoreError};
use crate::timeframe::Timeframe;
use std::io::Write;
use thiserror::Error;

/// Candles read per chunk, expressed in buckets of the exported timeframe.
const BUCKETS_PER_READ: i64 = 10_000;

pub const CSV_HEADER: [&str; 10] = [
    "venue",
    "symbol",
    "timeframe",
    "open_time_ms",
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write every stored candle of `timeframe` in `range` to `out`. Returns the
/// number of data rows written.
pub fn export_csv<W: Write>(
    store: &dyn CandleStore,
    key: &SeriesKey,
    timeframe: Timeframe,
    range: TimeRange,
    out: W,
) -> Result<usize, ExportError> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(CSV_HEADER)?;

    let mut rows = 0;
    for chunk in range.split(BUCKETS_PER_READ * timeframe.duration_ms()) {
        for c in store.read_candles(key, timeframe, chunk)? {
            wtr.write_record([
                c.venue,
                c.symbol,
                c.timeframe.label(),
                c.open_time_ms.to_string(),
                format_timestamp_ms(c.open_time_ms),
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
            ])?;
            rows += 1;
        }
    }
    wtr.flush()?;
    Ok(rows)
}
