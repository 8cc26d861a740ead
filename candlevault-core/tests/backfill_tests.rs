//! Backfill engine against the SQLite store and the scripted mock venue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use candlevault_core::backfill::{
    BackfillEngine, BackfillError, BackfillOutcome, BackfillProgress, BackfillReport,
    BackfillRequest, DataIntegrityWarning, RetryPolicy, SilentProgress, WindowReport,
};
use candlevault_core::clock::parse_timestamp_ms;
use candlevault_core::domain::CoverageRecord;
use candlevault_core::store::{CandleStore, CoverageUpdate, StoreError};
use candlevault_core::venue::{FetchError, MockVenue, VenueRegistry};
use candlevault_core::{
    Candle, EndBound, ManualClock, SeriesKey, SqliteStore, TimeRange, Timeframe, ONE_MINUTE,
};

const MIN: i64 = 60_000;
const DAY: i64 = 1_440 * MIN;

// ── Helpers ──────────────────────────────────────────────────────────

fn ts(s: &str) -> i64 {
    parse_timestamp_ms(s).unwrap()
}

fn key() -> SeriesKey {
    SeriesKey::new("mock", "BTC/USDT")
}

struct Harness {
    store: Arc<SqliteStore>,
    venue: Arc<MockVenue>,
    clock: Arc<ManualClock>,
    engine: BackfillEngine,
}

fn harness(now: i64) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory(ONE_MINUTE).unwrap());
    let venue = Arc::new(MockVenue::new("mock"));
    let clock = Arc::new(ManualClock::new(now));
    let engine = BackfillEngine::new(store.clone(), VenueRegistry::new().with(venue.clone()))
        .with_clock(clock.clone())
        .with_retry_policy(RetryPolicy::immediate(2));
    Harness {
        store,
        venue,
        clock,
        engine,
    }
}

fn coverage(store: &SqliteStore) -> Vec<TimeRange> {
    store.coverage_ranges(&key(), ONE_MINUTE).unwrap()
}

fn fixed(start: i64, end: i64, chunk_days: u32) -> BackfillRequest {
    BackfillRequest::new("mock", "BTC/USDT", start)
        .with_end(EndBound::At(end))
        .with_chunk_days(chunk_days)
}

/// Every range in `before` is still covered by some range in `after`.
fn assert_monotonic(before: &[TimeRange], after: &[TimeRange]) {
    for b in before {
        assert!(
            after.iter().any(|a| a.contains_range(b)),
            "coverage shrank: {b} missing from {after:?}"
        );
    }
}

// ── Missing-range planning and resume ────────────────────────────────

#[test]
fn fills_only_the_missing_tail_in_daily_windows() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let dec31 = ts("2023-12-31T00:00:00Z");
    let jan2 = ts("2024-01-02T00:00:00Z");
    let jan5 = ts("2024-01-05T00:00:00Z");
    h.store.merge_coverage(&key(), ONE_MINUTE, TimeRange::new(dec31, jan2)).unwrap();

    let report = h.engine.run(&fixed(dec31, jan5, 1), &SilentProgress);
    assert!(report.is_success(), "{:?}", report.outcome);

    let windows: Vec<TimeRange> = report.windows.iter().map(|w| w.range).collect();
    assert_eq!(
        windows,
        vec![
            TimeRange::new(jan2, jan2 + DAY),
            TimeRange::new(jan2 + DAY, jan2 + 2 * DAY),
            TimeRange::new(jan2 + 2 * DAY, jan5),
        ]
    );
    let fetched: Vec<TimeRange> = h.venue.calls().into_iter().map(|(_, r)| r).collect();
    assert_eq!(fetched, windows);

    assert_eq!(report.rows_written(), 3 * 1_440);
    assert_eq!(coverage(&h.store), vec![TimeRange::new(dec31, jan5)]);
    assert_eq!(report.committed(), vec![TimeRange::new(jan2, jan5)]);
}

#[test]
fn rerun_over_covered_span_fetches_nothing() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let req = fixed(ts("2024-01-01T00:00:00Z"), ts("2024-01-03T00:00:00Z"), 1);

    let first = h.engine.run(&req, &SilentProgress);
    assert!(first.is_success());
    let calls = h.venue.call_count();
    let cov = coverage(&h.store);

    let second = h.engine.run(&req, &SilentProgress);
    assert!(second.is_success());
    assert!(second.windows.is_empty());
    assert_eq!(second.rows_written(), 0);
    assert_eq!(h.venue.call_count(), calls);
    assert_eq!(coverage(&h.store), cov);
}

#[test]
fn rewriting_identical_rows_changes_nothing() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let start = ts("2024-01-01T00:00:00Z");
    let report = h.engine.run(&fixed(start, start + 60 * MIN, 1), &SilentProgress);
    assert_eq!(report.rows_written(), 60);

    // Fresh coverage, same rows: upsert is a no-op.
    let store2 = Arc::new(SqliteStore::open_in_memory(ONE_MINUTE).unwrap());
    let rows = h
        .store
        .read_candles(&key(), ONE_MINUTE, TimeRange::new(start, start + 60 * MIN))
        .unwrap();
    assert_eq!(store2.upsert_candles(&rows).unwrap(), 60);
    assert_eq!(store2.upsert_candles(&rows).unwrap(), 0);
}

#[test]
fn unaligned_request_is_floored_to_the_base_timeframe() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let start = ts("2024-01-01T00:00:30Z");
    let end = ts("2024-01-01T00:10:45Z");
    let report = h.engine.run(&fixed(start, end, 1), &SilentProgress);
    let aligned = TimeRange::new(ts("2024-01-01T00:00:00Z"), ts("2024-01-01T00:10:00Z"));
    assert_eq!(report.requested, aligned);
    assert_eq!(coverage(&h.store), vec![aligned]);
    assert_eq!(report.rows_written(), 10);
}

#[test]
fn plan_reads_the_clock_on_every_call() {
    let h = harness(ts("2024-01-01T01:00:00Z"));
    let req = BackfillRequest::new("mock", "BTC/USDT", ts("2024-01-01T00:00:00Z"));

    let first = h.engine.plan(&req).unwrap();
    assert_eq!(first.requested.end_ms, ts("2024-01-01T01:00:00Z"));
    assert!(first.open_ended);

    h.clock.advance(30 * MIN);
    let second = h.engine.plan(&req).unwrap();
    assert_eq!(second.requested.end_ms, ts("2024-01-01T01:30:00Z"));
}

// ── Failures and retry ───────────────────────────────────────────────

#[test]
fn permanent_failure_stops_the_run_and_keeps_committed_coverage() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let jan1 = ts("2024-01-01T00:00:00Z");
    let req = fixed(jan1, jan1 + 3 * DAY, 1);
    h.venue
        .fail_window_at(jan1 + DAY, FetchError::Rejected("maintenance".into()));

    let report = h.engine.run(&req, &SilentProgress);
    assert!(!report.is_success());
    match report.error() {
        Some(BackfillError::Fetch {
            window, attempts, ..
        }) => {
            assert_eq!(*window, TimeRange::new(jan1 + DAY, jan1 + 2 * DAY));
            assert_eq!(*attempts, 1);
        }
        other => panic!("expected fetch error, got {other:?}"),
    }
    assert_eq!(report.windows.len(), 1);
    assert_eq!(report.remaining, vec![TimeRange::new(jan1 + DAY, jan1 + 3 * DAY)]);
    let partial = coverage(&h.store);
    assert_eq!(partial, vec![TimeRange::new(jan1, jan1 + DAY)]);

    // The next run resumes at the failed window.
    h.venue.clear_window_failures();
    let calls_before = h.venue.call_count();
    let resumed = h.engine.run(&req, &SilentProgress);
    assert!(resumed.is_success());
    assert_eq!(resumed.windows[0].range.start_ms, jan1 + DAY);
    assert_eq!(h.venue.call_count() - calls_before, 2);
    let full = coverage(&h.store);
    assert_monotonic(&partial, &full);
    assert_eq!(full, vec![TimeRange::new(jan1, jan1 + 3 * DAY)]);
}

#[test]
fn transient_failures_are_retried_within_budget() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let jan1 = ts("2024-01-01T00:00:00Z");
    h.venue.push_failure(FetchError::NetworkUnreachable("reset".into()));
    h.venue.push_failure(FetchError::RateLimited { retry_after_secs: 0 });

    let report = h.engine.run(&fixed(jan1, jan1 + 60 * MIN, 1), &SilentProgress);
    assert!(report.is_success());
    assert_eq!(report.windows[0].attempts, 3);
    assert_eq!(coverage(&h.store), vec![TimeRange::new(jan1, jan1 + 60 * MIN)]);
}

#[test]
fn exhausted_retries_fail_without_advancing_coverage() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let jan1 = ts("2024-01-01T00:00:00Z");
    for _ in 0..3 {
        h.venue.push_failure(FetchError::Upstream("502".into()));
    }

    let report = h.engine.run(&fixed(jan1, jan1 + 60 * MIN, 1), &SilentProgress);
    let err = report.error().expect("run should fail");
    assert!(err.is_retryable());
    assert!(coverage(&h.store).is_empty());
    assert_eq!(report.remaining, vec![TimeRange::new(jan1, jan1 + 60 * MIN)]);
}

#[test]
fn unknown_symbol_is_not_retried() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    h.venue.add_unknown_symbol("BTC/USDT");
    let jan1 = ts("2024-01-01T00:00:00Z");
    let report = h.engine.run(&fixed(jan1, jan1 + DAY, 1), &SilentProgress);
    assert!(matches!(
        report.error(),
        Some(BackfillError::Fetch {
            source: FetchError::UnknownSymbol { .. },
            attempts: 1,
            ..
        })
    ));
    assert_eq!(h.venue.call_count(), 1);
}

/// A store whose window commits start failing after `ok_commits` succeed.
struct FlakyStore {
    inner: SqliteStore,
    ok_commits: usize,
    commits: AtomicUsize,
}

impl CandleStore for FlakyStore {
    fn read_candles(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError> {
        self.inner.read_candles(key, timeframe, range)
    }

    fn get_coverage(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
    ) -> Result<Vec<CoverageRecord>, StoreError> {
        self.inner.get_coverage(key, base_timeframe)
    }

    fn merge_coverage(
        &self,
        key: &SeriesKey,
        base_timeframe: Timeframe,
        new_range: TimeRange,
    ) -> Result<Vec<CoverageRecord>, StoreError> {
        self.inner.merge_coverage(key, base_timeframe, new_range)
    }

    fn commit_window(
        &self,
        rows: &[Candle],
        coverage: Option<&CoverageUpdate>,
    ) -> Result<usize, StoreError> {
        if self.commits.fetch_add(1, Ordering::SeqCst) >= self.ok_commits {
            return Err(StoreError::Other("disk full".into()));
        }
        self.inner.commit_window(rows, coverage)
    }

    fn time_bounds(
        &self,
        key: &SeriesKey,
        timeframe: Timeframe,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        self.inner.time_bounds(key, timeframe)
    }

    fn list_series(&self, base_timeframe: Timeframe) -> Result<Vec<SeriesKey>, StoreError> {
        self.inner.list_series(base_timeframe)
    }
}

#[test]
fn store_failure_is_fatal_and_leaves_no_partial_window() {
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open_in_memory(ONE_MINUTE).unwrap(),
        ok_commits: 1,
        commits: AtomicUsize::new(0),
    });
    let venue = Arc::new(MockVenue::new("mock"));
    let engine = BackfillEngine::new(store.clone(), VenueRegistry::new().with(venue))
        .with_clock(Arc::new(ManualClock::new(ts("2024-01-10T00:00:00Z"))))
        .with_retry_policy(RetryPolicy::immediate(0));

    let jan1 = ts("2024-01-01T00:00:00Z");
    let report = engine.run(&fixed(jan1, jan1 + 3 * DAY, 1), &SilentProgress);
    assert!(matches!(report.error(), Some(BackfillError::Store(_))));
    assert_eq!(report.windows.len(), 1);
    assert_eq!(report.remaining, vec![TimeRange::new(jan1 + DAY, jan1 + 3 * DAY)]);

    assert_eq!(
        store.coverage_ranges(&key(), ONE_MINUTE).unwrap(),
        vec![TimeRange::new(jan1, jan1 + DAY)]
    );
    let beyond = store
        .read_candles(&key(), ONE_MINUTE, TimeRange::new(jan1 + DAY, jan1 + 3 * DAY))
        .unwrap();
    assert!(beyond.is_empty());
}

// ── Trailing window and upstream gaps ────────────────────────────────

#[test]
fn trailing_window_is_covered_only_up_to_the_last_closed_candle() {
    let jan5 = ts("2024-01-05T00:00:00Z");
    let now = jan5 + 10 * MIN + 30_000;
    let h = harness(now);
    // The venue lags two minutes behind the clock.
    h.venue.set_available_until(now - 2 * MIN);

    let req = BackfillRequest::new("mock", "BTC/USDT", jan5);
    let report = h.engine.run(&req, &SilentProgress);
    assert!(report.is_success());
    let window = &report.windows[0];
    assert!(window.trailing);
    assert_eq!(window.range, TimeRange::new(jan5, jan5 + 10 * MIN));
    assert_eq!(window.written, 8);
    assert_eq!(window.covered, Some(TimeRange::new(jan5, jan5 + 8 * MIN)));
    assert_eq!(coverage(&h.store), vec![TimeRange::new(jan5, jan5 + 8 * MIN)]);

    // Five minutes later the held tail is fetched again and closes.
    h.clock.advance(5 * MIN);
    h.venue.set_available_until(now + 5 * MIN);
    let next = h.engine.run(&req, &SilentProgress);
    assert_eq!(next.windows[0].range, TimeRange::new(jan5 + 8 * MIN, jan5 + 15 * MIN));
    assert_eq!(coverage(&h.store), vec![TimeRange::new(jan5, jan5 + 15 * MIN)]);
}

#[test]
fn trailing_window_with_no_closed_candles_is_not_covered() {
    let jan5 = ts("2024-01-05T00:00:00Z");
    let h = harness(jan5 + 3 * MIN);
    h.venue.set_available_until(jan5);

    let report = h
        .engine
        .run(&BackfillRequest::new("mock", "BTC/USDT", jan5), &SilentProgress);
    assert!(report.is_success());
    assert!(report.windows[0].zero_rows);
    assert_eq!(report.windows[0].covered, None);
    assert!(coverage(&h.store).is_empty());
}

#[test]
fn fixed_end_in_the_future_is_treated_as_open_ended() {
    let jan5 = ts("2024-01-05T00:00:00Z");
    let h = harness(jan5 + 30 * MIN);
    h.venue.set_available_until(jan5 + 20 * MIN);

    let report = h.engine.run(&fixed(jan5, jan5 + DAY, 1), &SilentProgress);
    assert_eq!(report.requested, TimeRange::new(jan5, jan5 + 30 * MIN));
    assert!(report.windows[0].trailing);
    assert_eq!(coverage(&h.store), vec![TimeRange::new(jan5, jan5 + 20 * MIN)]);
}

#[test]
fn empty_historical_window_is_covered_as_upstream_gap() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let jan1 = ts("2024-01-01T00:00:00Z");
    h.venue.add_gap(TimeRange::new(jan1 + DAY, jan1 + 2 * DAY));

    let report = h.engine.run(&fixed(jan1, jan1 + 3 * DAY, 1), &SilentProgress);
    assert!(report.is_success());
    assert_eq!(
        report.zero_row_windows(),
        vec![TimeRange::new(jan1 + DAY, jan1 + 2 * DAY)]
    );
    assert_eq!(coverage(&h.store), vec![TimeRange::new(jan1, jan1 + 3 * DAY)]);

    // Covered gaps are not re-fetched.
    let calls = h.venue.call_count();
    h.engine.run(&fixed(jan1, jan1 + 3 * DAY, 1), &SilentProgress);
    assert_eq!(h.venue.call_count(), calls);
}

// ── Canonicalization ─────────────────────────────────────────────────

#[test]
fn stray_duplicate_and_invalid_rows_are_discarded() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let jan1 = ts("2024-01-01T00:00:00Z");
    h.venue.set_stray_rows(true);
    h.venue.corrupt_at(jan1 + 5 * MIN);

    let report = h.engine.run(&fixed(jan1, jan1 + 60 * MIN, 1), &SilentProgress);
    assert!(report.is_success());
    let window = &report.windows[0];
    assert_eq!(window.fetched, 63);
    assert_eq!(window.written, 59);
    assert_eq!(report.warning_count(), 4);
    assert!(window
        .warnings
        .iter()
        .any(|w| matches!(w, DataIntegrityWarning::Invalid { .. })));
    assert!(window
        .warnings
        .iter()
        .any(|w| matches!(w, DataIntegrityWarning::Duplicate { .. })));

    let rows = h
        .store
        .read_candles(&key(), ONE_MINUTE, TimeRange::new(jan1 - DAY, jan1 + DAY))
        .unwrap();
    assert_eq!(rows.len(), 59);
    assert!(rows.iter().all(|c| c.open_time_ms >= jan1 && c.open_time_ms < jan1 + 60 * MIN));
    assert!(rows.iter().all(Candle::is_sane));
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Raises the cancel flag after the first committed window.
struct CancelAfterFirst {
    flag: Arc<AtomicBool>,
}

impl BackfillProgress for CancelAfterFirst {
    fn on_plan(&self, _key: &SeriesKey, _missing: &[TimeRange], _windows: usize) {}

    fn on_window(&self, _key: &SeriesKey, _index: usize, _total: usize, _window: &WindowReport) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn on_finish(&self, _report: &BackfillReport) {}
}

#[test]
fn cancellation_stops_at_a_window_boundary() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    let jan1 = ts("2024-01-01T00:00:00Z");
    let progress = CancelAfterFirst {
        flag: h.engine.cancel_flag(),
    };

    let report = h.engine.run(&fixed(jan1, jan1 + 3 * DAY, 1), &progress);
    assert!(matches!(report.outcome, BackfillOutcome::Cancelled));
    assert_eq!(report.windows.len(), 1);
    assert_eq!(report.remaining, vec![TimeRange::new(jan1 + DAY, jan1 + 3 * DAY)]);
    assert_eq!(coverage(&h.store), vec![TimeRange::new(jan1, jan1 + DAY)]);
    assert_eq!(h.venue.call_count(), 1);
}

// ── Parallel series ──────────────────────────────────────────────────

#[test]
fn series_run_independently_in_request_order() {
    let h = harness(ts("2024-01-10T00:00:00Z"));
    h.venue.add_unknown_symbol("NOPE/USDT");
    let jan1 = ts("2024-01-01T00:00:00Z");
    let requests: Vec<BackfillRequest> = ["BTC/USDT", "NOPE/USDT", "ETH/USDT"]
        .iter()
        .map(|s| {
            BackfillRequest::new("mock", *s, jan1)
                .with_end(EndBound::At(jan1 + 2 * DAY))
                .with_chunk_days(1)
        })
        .collect();

    let reports = h.engine.run_many(&requests, &SilentProgress);
    let symbols: Vec<&str> = reports.iter().map(|r| r.key.symbol.as_str()).collect();
    assert_eq!(symbols, ["BTC/USDT", "NOPE/USDT", "ETH/USDT"]);
    assert!(reports[0].is_success());
    assert!(!reports[1].is_success());
    assert!(reports[2].is_success());

    let eth = SeriesKey::new("mock", "ETH/USDT");
    assert_eq!(
        h.store.coverage_ranges(&eth, ONE_MINUTE).unwrap(),
        vec![TimeRange::new(jan1, jan1 + 2 * DAY)]
    );
    let mut listed = h.store.list_series(ONE_MINUTE).unwrap();
    listed.sort();
    assert_eq!(listed, vec![key(), eth]);
}

#[test]
fn file_backed_store_resumes_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.sqlite");
    let jan1 = ts("2024-01-01T00:00:00Z");
    let now = Arc::new(ManualClock::new(ts("2024-01-10T00:00:00Z")));
    let venue = Arc::new(MockVenue::new("mock"));
    venue.fail_window_at(jan1 + DAY, FetchError::Rejected("down".into()));

    {
        let store = Arc::new(SqliteStore::open(&path, ONE_MINUTE).unwrap());
        let engine = BackfillEngine::new(store, VenueRegistry::new().with(venue.clone()))
            .with_clock(now.clone())
            .with_retry_policy(RetryPolicy::immediate(0));
        let report = engine.run(&fixed(jan1, jan1 + 2 * DAY, 1), &SilentProgress);
        assert!(!report.is_success());
    }

    venue.clear_window_failures();
    let store = Arc::new(SqliteStore::open(&path, ONE_MINUTE).unwrap());
    assert_eq!(
        store.coverage_ranges(&key(), ONE_MINUTE).unwrap(),
        vec![TimeRange::new(jan1, jan1 + DAY)]
    );
    let engine = BackfillEngine::new(store.clone(), VenueRegistry::new().with(venue.clone()))
        .with_clock(now)
        .with_retry_policy(RetryPolicy::immediate(0));
    let report = engine.run(&fixed(jan1, jan1 + 2 * DAY, 1), &SilentProgress);
    assert!(report.is_success());
    assert_eq!(report.windows.len(), 1);
    assert_eq!(
        store.coverage_ranges(&key(), ONE_MINUTE).unwrap(),
        vec![TimeRange::new(jan1, jan1 + 2 * DAY)]
    );
}
