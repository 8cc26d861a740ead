//! Table layout for the SQLite store.
//!
//! One table per timeframe, all with the same column shape and primary key
//! `(venue, symbol, ts_ms)`. The base timeframe lives in `ohlcv_<label>`,
//! every derived timeframe in `bars_<label>`. Adding a timeframe is a
//! configuration change; tables are created on first use.

use crate::timeframe::Timeframe;
use rusqlite::Connection;
use thiserror::Error;

pub const COVERAGE_TABLE: &str = "history_coverage";

/// Columns every candle table must have, in select order.
pub const CANDLE_COLUMNS: [&str; 8] = [
    "venue", "symbol", "ts_ms", "open", "high", "low", "close", "volume",
];

/// Maps a timeframe to its table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMap {
    base: Timeframe,
}

impl TableMap {
    pub fn new(base: Timeframe) -> Self {
        Self { base }
    }

    pub fn base(&self) -> Timeframe {
        self.base
    }

    /// Table for `timeframe`. Labels are `[0-9]+[smhdw]`, so the result is
    /// always a safe SQL identifier.
    pub fn table_for(&self, timeframe: Timeframe) -> String {
        if timeframe == self.base {
            format!("ohlcv_{}", timeframe.label())
        } else {
            format!("bars_{}", timeframe.label())
        }
    }
}

pub fn coverage_ddl() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {COVERAGE_TABLE} (
            venue TEXT NOT NULL,
            symbol TEXT NOT NULL,
            base_timeframe TEXT NOT NULL,
            range_start_ms INTEGER NOT NULL,
            range_end_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (venue, symbol, base_timeframe, range_start_ms)
        );
        "#
    )
}

pub fn candle_table_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            venue TEXT NOT NULL,
            symbol TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            PRIMARY KEY (venue, symbol, ts_ms)
        );
        "#
    )
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("missing required column {column} in {table}")]
    MissingColumn { table: String, column: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Check an existing candle table has every required column.
pub fn validate_candle_table(conn: &Connection, table: &str) -> Result<(), SchemaError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    // A table that does not exist yet reports no columns; it is created lazily.
    if columns.is_empty() {
        return Ok(());
    }
    for required in CANDLE_COLUMNS {
        if !columns.iter().any(|c| c == required) {
            return Err(SchemaError::MissingColumn {
                table: table.to_string(),
                column: required.to_string(),
            });
        }
    }
    Ok(())
}
