//! Coverage tracking — which spans of the base series are already persisted.
//!
//! A coverage set is a sorted list of disjoint, non-adjacent half-open
//! ranges. [`merge_range`] keeps a set in that minimal form; [`missing_ranges`]
//! diffs a requested span against it. Both are pure: the persisted set lives
//! in the store, and a restart re-derives where to resume from it.

use crate::domain::TimeRange;

/// Sub-ranges of `[requested_start, requested_end)` not covered by `coverage`.
///
/// The result is ascending, disjoint and clipped to the requested span.
/// `coverage` does not need to be sorted or coalesced. Adjacent missing
/// ranges are not merged here; coalescing only happens when coverage is
/// written.
pub fn missing_ranges(
    coverage: &[TimeRange],
    requested_start: i64,
    requested_end: i64,
) -> Vec<TimeRange> {
    if requested_end <= requested_start {
        return Vec::new();
    }

    let mut sorted: Vec<TimeRange> = coverage.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort_by_key(|r| (r.start_ms, r.end_ms));

    let mut missing = Vec::new();
    let mut cursor = requested_start;

    for covered in sorted {
        if covered.end_ms <= cursor {
            continue;
        }
        if covered.start_ms >= requested_end {
            break;
        }
        if covered.start_ms > cursor {
            missing.push(TimeRange::new(cursor, covered.start_ms));
        }
        cursor = cursor.max(covered.end_ms);
        if cursor >= requested_end {
            break;
        }
    }

    if cursor < requested_end {
        missing.push(TimeRange::new(cursor, requested_end));
    }
    missing
}

/// Sort and coalesce overlapping or adjacent ranges into the minimal set.
pub fn coalesce(mut ranges: Vec<TimeRange>) -> Vec<TimeRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| (r.start_ms, r.end_ms));

    let mut out: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match out.last_mut() {
            Some(last) if last.overlaps_or_touches(&r) => {
                last.end_ms = last.end_ms.max(r.end_ms);
            }
            _ => out.push(r),
        }
    }
    out
}

/// Insert `new_range` into a minimal coverage set, keeping it minimal.
pub fn merge_range(coverage: &[TimeRange], new_range: TimeRange) -> Vec<TimeRange> {
    let mut all = coverage.to_vec();
    all.push(new_range);
    coalesce(all)
}

/// Total covered milliseconds inside `[start, end)`.
pub fn covered_ms(coverage: &[TimeRange], start: i64, end: i64) -> i64 {
    let span = TimeRange::new(start, end);
    coalesce(coverage.to_vec())
        .iter()
        .filter_map(|r| r.intersect(&span))
        .map(|r| r.len_ms())
        .sum()
}

/// True if the set is sorted, non-empty-ranged, disjoint and non-adjacent.
pub fn is_minimal(coverage: &[TimeRange]) -> bool {
    coverage.iter().all(|r| !r.is_empty())
        && coverage.windows(2).all(|w| w[0].end_ms < w[1].start_ms)
}
