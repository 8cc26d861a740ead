//! Gap repair over covered-but-holey base series.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use candlevault_core::backfill::RetryPolicy;
use candlevault_core::repair::{find_gaps, GapRepair, GapRepairConfig, RepairError};
use candlevault_core::store::{CandleStore, CoverageUpdate};
use candlevault_core::venue::mock::synthetic_candle;
use candlevault_core::venue::{FetchError, MockVenue, VenueRegistry};
use candlevault_core::{SeriesKey, SqliteStore, TimeRange, ONE_MINUTE};

const MIN: i64 = 60_000;

fn key() -> SeriesKey {
    SeriesKey::new("mock", "BTC/USDT")
}

/// Minutes `0..60` minus `10..20`, with the full hour marked covered.
fn holey_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory(ONE_MINUTE).unwrap());
    let rows: Vec<_> = (0..60)
        .filter(|m| !(10..20).contains(m))
        .map(|m| synthetic_candle("mock", "BTC/USDT", ONE_MINUTE, m * MIN))
        .collect();
    let update = CoverageUpdate {
        key: key(),
        base_timeframe: ONE_MINUTE,
        range: TimeRange::new(0, 60 * MIN),
    };
    store.commit_window(&rows, Some(&update)).unwrap();
    store
}

fn repair(store: &Arc<SqliteStore>, venue: &Arc<MockVenue>, config: GapRepairConfig) -> GapRepair {
    GapRepair::new(
        store.clone(),
        VenueRegistry::new().with(venue.clone()),
        ONE_MINUTE,
        config,
    )
    .with_retry_policy(RetryPolicy::immediate(1))
}

fn scan() -> TimeRange {
    TimeRange::new(0, 60 * MIN)
}

#[test]
fn refetches_holes_without_touching_coverage() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    let coverage_before = store.get_coverage(&key(), ONE_MINUTE).unwrap();

    let report = repair(&store, &venue, GapRepairConfig::default())
        .run(&key(), scan())
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.gaps_found, vec![TimeRange::new(10 * MIN, 20 * MIN)]);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.written, 10);

    assert_eq!(store.get_coverage(&key(), ONE_MINUTE).unwrap(), coverage_before);
    assert!(find_gaps(&*store, &key(), ONE_MINUTE, scan(), 10).unwrap().is_empty());
}

#[test]
fn gaps_are_fetched_in_bounded_chunks() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    let config = GapRepairConfig {
        chunk_minutes: 3,
        ..GapRepairConfig::default()
    };

    let report = repair(&store, &venue, config).run(&key(), scan()).unwrap();
    let windows: Vec<TimeRange> = venue.calls().into_iter().map(|(_, r)| r).collect();
    assert_eq!(
        windows,
        vec![
            TimeRange::new(10 * MIN, 13 * MIN),
            TimeRange::new(13 * MIN, 16 * MIN),
            TimeRange::new(16 * MIN, 19 * MIN),
            TimeRange::new(19 * MIN, 20 * MIN),
        ]
    );
    assert_eq!(report.fetched, 10);
}

#[test]
fn oversized_gaps_are_reported_but_skipped() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    let config = GapRepairConfig {
        max_gap_minutes: 5,
        ..GapRepairConfig::default()
    };

    let report = repair(&store, &venue, config).run(&key(), scan()).unwrap();
    assert_eq!(report.skipped, vec![TimeRange::new(10 * MIN, 20 * MIN)]);
    assert_eq!(report.attempted, 0);
    assert_eq!(venue.call_count(), 0);
}

#[test]
fn hole_the_venue_still_lacks_stays_a_hole() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    venue.add_gap(TimeRange::new(10 * MIN, 20 * MIN));

    let report = repair(&store, &venue, GapRepairConfig::default())
        .run(&key(), scan())
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.written, 0);
    assert_eq!(
        find_gaps(&*store, &key(), ONE_MINUTE, scan(), 10).unwrap(),
        vec![TimeRange::new(10 * MIN, 20 * MIN)]
    );
}

#[test]
fn permanent_fetch_error_stops_the_repair() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    venue.add_unknown_symbol("BTC/USDT");
    let config = GapRepairConfig {
        chunk_minutes: 2,
        ..GapRepairConfig::default()
    };

    let report = repair(&store, &venue, config).run(&key(), scan()).unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(venue.call_count(), 1);
}

#[test]
fn transient_errors_exhausting_retries_skip_to_the_next_window() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    venue.fail_window_at(10 * MIN, FetchError::Upstream("503".into()));
    let config = GapRepairConfig {
        chunk_minutes: 5,
        ..GapRepairConfig::default()
    };

    let report = repair(&store, &venue, config).run(&key(), scan()).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, TimeRange::new(10 * MIN, 15 * MIN));
    assert_eq!(report.written, 5);
}

#[test]
fn cancelled_repair_fetches_nothing() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));
    let report = repair(&store, &venue, GapRepairConfig::default())
        .with_cancel_flag(Arc::new(AtomicBool::new(true)))
        .run(&key(), scan())
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(venue.call_count(), 0);
}

#[test]
fn setup_errors_are_returned() {
    let store = holey_store();
    let venue = Arc::new(MockVenue::new("mock"));

    let other = SeriesKey::new("kraken", "BTC/USDT");
    let err = repair(&store, &venue, GapRepairConfig::default())
        .run(&other, scan())
        .unwrap_err();
    assert!(matches!(err, RepairError::Fetch(FetchError::UnknownVenue { .. })));

    let config = GapRepairConfig {
        chunk_minutes: 0,
        ..GapRepairConfig::default()
    };
    let err = repair(&store, &venue, config).run(&key(), scan()).unwrap_err();
    assert!(matches!(err, RepairError::InvalidConfig(_)));
}
