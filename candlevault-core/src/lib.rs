//! CandleVault Core — coverage-tracked backfill and multi-timeframe aggregation.
//!
//! This crate contains the market-data pipeline behind the CLI:
//! - Domain types (candles, series keys, half-open time ranges, coverage)
//! - Timeframes with epoch-aligned bucket arithmetic
//! - SQLite candle store with idempotent upserts and atomic coverage commits
//! - Venue adapters (Binance spot REST, scripted mock) behind a registry
//! - Backfill engine: missing-range planning, windowed fetch, retry, resume
//! - Aggregation engine: closed-bucket OHLCV roll-up with gap detection
//! - Gap repair, live ingestion and CSV export

pub mod aggregate;
pub mod backfill;
pub mod clock;
pub mod config;
pub mod coverage;
pub mod domain;
pub mod export;
pub mod live;
pub mod repair;
pub mod store;
pub mod timeframe;
pub mod venue;

pub use clock::{Clock, EndBound, ManualClock, SystemClock};
pub use domain::{Candle, SeriesKey, TimeRange};
pub use store::{CandleStore, SqliteStore};
pub use timeframe::{Timeframe, ONE_MINUTE};
