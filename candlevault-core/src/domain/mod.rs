//! Domain types for candlevault

pub mod candle;
pub mod range;

pub use candle::{Candle, CandleError, SeriesKey};
pub use range::{CoverageRecord, TimeRange};
