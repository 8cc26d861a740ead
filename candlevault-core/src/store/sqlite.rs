//! SQLite-backed candle store.
//!
//! Features:
//! - One table per timeframe, created on first use
//! - Upserts that skip identical rows, so changed-row counts are exact
//! - Candle batch + coverage merge committed in one transaction
//! - WAL journal with a busy timeout so readers never block the writer

use super::schema::{self, TableMap, COVERAGE_TABLE};
use super::{validate_batch, CandleStore, CoverageUpdate, StoreError};
use crate::coverage;
use crate::domain::{Candle, CoverageRecord, SeriesKey, TimeRange};
use crate::timeframe::Timeframe;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

struct Inner {
    conn: Connection,
    ensured_tables: HashSet<String>,
}

/// A single-connection store. The connection mutex is the per-store write
/// lock: every writer goes through it, one transaction at a time.
pub struct SqliteStore {
    inner: Mutex<Inner>,
    tables: TableMap,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, base_timeframe: Timeframe) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // Best-effort: some filesystems refuse WAL, rollback journal still works.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");

        debug!(path = %path.display(), base = %base_timeframe, "opened sqlite store");
        Self::init(conn, base_timeframe)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory(base_timeframe: Timeframe) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, base_timeframe)
    }

    fn init(conn: Connection, base_timeframe: Timeframe) -> Result<Self, StoreError> {
        conn.execute_batch(&schema::coverage_ddl())?;
        let store = Self {
            inner: Mutex::new(Inner {
                conn,
                ensured_tables: HashSet::new(),
            }),
            tables: TableMap::new(base_timeframe),
        };
        {
            let mut guard = store.lock()?;
            let Inner {
                conn,
                ensured_tables,
            } = &mut *guard;
            ensure_table(conn, ensured_tables, &store.tables.table_for(base_timeframe))?;
        }
        Ok(store)
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.tables.base()
    }

    pub fn table_map(&self) -> TableMap {
        self.tables
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn ensure_table(
    conn: &Connection,
    ensured: &mut HashSet<String>,
    table: &str,
) -> Result<(), StoreError> {
    if ensured.contains(table) {
        return Ok(());
    }
    schema::validate_candle_table(conn, table)?;
    conn.execute_batch(&schema::candle_table_ddl(table))?;
    ensured.insert(table.to_string());
    Ok(())
}

fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (venue, symbol, ts_ms, open, high, low, close, volume)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(venue, symbol, ts_ms) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume
        WHERE {table}.open IS NOT excluded.open
           OR {table}.high IS NOT excluded.high
           OR {table}.low IS NOT excluded.low
           OR {table}.close IS NOT excluded.close
           OR {table}.volume IS NOT excluded.volume
        "#
    )
}

fn load_coverage(
    conn: &Connection,
    key: &SeriesKey,
    base_timeframe: Timeframe,
) -> Result<Vec<TimeRange>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT range_start_ms, range_end_ms FROM {COVERAGE_TABLE} \
         WHERE venue = ?1 AND symbol = ?2 AND base_timeframe = ?3 \
         ORDER BY range_start_ms ASC"
    ))?;
    let rows = stmt.query_map(
        params![key.venue, key.symbol, base_timeframe.label()],
        |row| Ok(TimeRange::new(row.get(0)?, row.get(1)?)),
    )?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn merge_coverage_in(
    conn: &Connection,
    update: &CoverageUpdate,
) -> Result<Vec<TimeRange>, StoreError> {
    let existing = load_coverage(conn, &update.key, update.base_timeframe)?;
    let merged = coverage::merge_range(&existing, update.range);
    if merged == existing {
        return Ok(merged);
    }

    let label = update.base_timeframe.label();
    conn.execute(
        &format!(
            "DELETE FROM {COVERAGE_TABLE} WHERE venue = ?1 AND symbol = ?2 AND base_timeframe = ?3"
        ),
        params![update.key.venue, update.key.symbol, label],
    )?;

    let updated_at = Utc::now().timestamp_millis();
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {COVERAGE_TABLE} \
         (venue, symbol, base_timeframe, range_start_ms, range_end_ms, updated_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    ))?;
    for r in &merged {
        stmt.execute(params![
            update.key.venue,
            update.key.symbol,
            label,
            r.start_ms,
            r.end_ms,
            updated_at
        ])?;
    }
    Ok(merged)
}

fn to_records(key: &SeriesKey, base_timeframe: Timeframe, ranges: Vec<TimeRange>) -> Vec<CoverageRecord> {
    ranges
        .into_iter()
        .map(|range| CoverageRecord {
            venue: key.venue.clone(),
            symbol: key.symbol.clone(),
            base_timeframe,
            range,
        })
        .collect()
}

impl CandleStore for SqliteStore {
    fn read_candles(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.tables.table_for(timeframe);
        let mut guard = self.lock()?;
        let Inner {
            conn,
            ensured_tables,
        } = &mut *guard;
        ensure_table(conn, ensured_tables, &table)?;

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT ts_ms, open, high, low, close, volume FROM {table} \
             WHERE venue = ?1 AND symbol = ?2 AND ts_ms >= ?3 AND ts_ms < ?4 \
             ORDER BY ts_ms ASC"
        ))?;
        let rows = stmt.query_map(
            params![key.venue, key.symbol, range.start_ms, range.end_ms],
            |row| {
                Ok(Candle {
                    venue: key.venue.clone(),
                    symbol: key.symbol.clone(),
                    timeframe,
                    open_time_ms: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn get_coverage(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
    ) -> Result<Vec<CoverageRecord>, StoreError> {
        let guard = self.lock()?;
        let ranges = load_coverage(&guard.conn, key, base_timeframe)?;
        Ok(to_records(key, base_timeframe, ranges))
    }

    fn merge_coverage(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
        new_range: TimeRange,
    ) -> Result<Vec<CoverageRecord>, StoreError> {
        let update = CoverageUpdate {
            key: key.clone(),
            base_timeframe,
            range: new_range,
        };
        let mut guard = self.lock()?;
        let tx = guard.conn.transaction()?;
        let merged = merge_coverage_in(&tx, &update)?;
        tx.commit()?;
        Ok(to_records(key, base_timeframe, merged))
    }

    fn commit_window(
        &self,
        rows: &[Candle],
        coverage: Option<&CoverageUpdate>,
    ) -> Result<usize, StoreError> {
        validate_batch(rows)?;

        let mut sql_by_timeframe: HashMap<Timeframe, String> = HashMap::new();
        for row in rows {
            sql_by_timeframe
                .entry(row.timeframe)
                .or_insert_with(|| upsert_sql(&self.tables.table_for(row.timeframe)));
        }

        let mut guard = self.lock()?;
        let Inner {
            conn,
            ensured_tables,
        } = &mut *guard;
        for timeframe in sql_by_timeframe.keys() {
            ensure_table(conn, ensured_tables, &self.tables.table_for(*timeframe))?;
        }

        let tx = conn.transaction()?;
        let mut changed = 0;
        for row in rows {
            let sql = &sql_by_timeframe[&row.timeframe];
            let mut stmt = tx.prepare_cached(sql)?;
            changed += stmt.execute(params![
                row.venue,
                row.symbol,
                row.open_time_ms,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume
            ])?;
        }
        if let Some(update) = coverage {
            merge_coverage_in(&tx, update)?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn time_bounds(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let table = self.tables.table_for(timeframe);
        let mut guard = self.lock()?;
        let Inner {
            conn,
            ensured_tables,
        } = &mut *guard;
        ensure_table(conn, ensured_tables, &table)?;

        let bounds = conn.query_row(
            &format!("SELECT MIN(ts_ms), MAX(ts_ms) FROM {table} WHERE venue = ?1 AND symbol = ?2"),
            params![key.venue, key.symbol],
            |row| {
                let min: Option<i64> = row.get(0)?;
                let max: Option<i64> = row.get(1)?;
                Ok(min.zip(max))
            },
        )?;
        Ok(bounds)
    }

    fn list_series(&self, base_timeframe: Timeframe) -> Result<Vec<SeriesKey>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard.conn.prepare(&format!(
            "SELECT DISTINCT venue, symbol FROM {COVERAGE_TABLE} \
             WHERE base_timeframe = ?1 ORDER BY venue, symbol"
        ))?;
        let rows = stmt.query_map(params![base_timeframe.label()], |row| {
            Ok(SeriesKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
