//! Pure multi-timeframe roll-up.
//!
//! One ascending base stream fans out to one bucket accumulator per target
//! timeframe. Buckets are epoch-aligned. A bucket is emitted only once it is
//! closed: its final base sub-interval is present, and either a later base
//! candle exists or the bucket ended before "now".

use super::AggregateError;
use crate::domain::{Candle, SeriesKey};
use crate::timeframe::Timeframe;
use serde::Serialize;
use tracing::{debug, warn};

/// A closed bucket built from fewer base candles than it spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapDetected {
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub present: i64,
    pub expected: i64,
}

/// Why a bucket that received base candles was not emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// The base candle for the bucket's final sub-interval is missing.
    MissingFinal,
    /// The bucket has not elapsed and no later base candle exists yet.
    StillOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldBucket {
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub reason: HoldReason,
}

#[derive(Debug, Clone)]
struct Bucket {
    open_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    count: i64,
    last_base_open_ms: i64,
}

impl Bucket {
    fn start(open_time_ms: i64, base: &Candle) -> Self {
        Self {
            open_time_ms,
            open: base.open,
            high: base.high,
            low: base.low,
            close: base.close,
            volume: base.volume,
            count: 1,
            last_base_open_ms: base.open_time_ms,
        }
    }

    fn add(&mut self, base: &Candle) {
        self.high = self.high.max(base.high);
        self.low = self.low.min(base.low);
        self.close = base.close;
        self.volume += base.volume;
        self.count += 1;
        self.last_base_open_ms = base.open_time_ms;
    }
}

#[derive(Debug)]
struct Slot {
    target: Timeframe,
    expected: i64,
    current: Option<Bucket>,
}

#[derive(Debug)]
pub struct Aggregator {
    key: SeriesKey,
    base: Timeframe,
    slots: Vec<Slot>,
    last_base_open_ms: Option<i64>,
    closed: Vec<Candle>,
    gaps: Vec<GapDetected>,
    held: Vec<HeldBucket>,
}

impl Aggregator {
    /// `targets` must be whole multiples of `base`. Duplicates collapse and a
    /// target equal to the base timeframe is dropped.
    pub fn new(
        key: SeriesKey,
        base: Timeframe,
        targets: &[Timeframe],
    ) -> Result<Self, AggregateError> {
        let mut targets = targets.to_vec();
        targets.sort();
        targets.dedup();

        let mut slots = Vec::with_capacity(targets.len());
        for target in targets {
            let expected = target.buckets_of(base)?;
            if target == base {
                warn!(timeframe = %target, "target equals base timeframe, skipping");
                continue;
            }
            slots.push(Slot {
                target,
                expected,
                current: None,
            });
        }
        if slots.is_empty() {
            return Err(AggregateError::NoTargets);
        }

        Ok(Self {
            key,
            base,
            slots,
            last_base_open_ms: None,
            closed: Vec::new(),
            gaps: Vec::new(),
            held: Vec::new(),
        })
    }

    pub fn targets(&self) -> Vec<Timeframe> {
        self.slots.iter().map(|s| s.target).collect()
    }

    /// Feed the next base candle. Candles must arrive in ascending open time;
    /// repeats and candles for another series are ignored.
    pub fn push(&mut self, candle: &Candle) {
        if candle.timeframe != self.base
            || candle.venue != self.key.venue
            || candle.symbol != self.key.symbol
        {
            warn!(series = %self.key, open_time_ms = candle.open_time_ms, "ignoring foreign candle");
            return;
        }
        if self
            .last_base_open_ms
            .is_some_and(|last| candle.open_time_ms <= last)
        {
            debug!(series = %self.key, open_time_ms = candle.open_time_ms, "ignoring out-of-order candle");
            return;
        }
        self.last_base_open_ms = Some(candle.open_time_ms);

        for i in 0..self.slots.len() {
            let bucket_open = self.slots[i].target.floor(candle.open_time_ms);
            let same_bucket = self.slots[i]
                .current
                .as_ref()
                .is_some_and(|b| b.open_time_ms == bucket_open);

            if same_bucket {
                if let Some(bucket) = self.slots[i].current.as_mut() {
                    bucket.add(candle);
                }
                continue;
            }
            // A later base candle exists, so only the final sub-interval matters.
            if let Some(previous) = self.slots[i].current.take() {
                self.settle(i, previous, true);
            }
            self.slots[i].current = Some(Bucket::start(bucket_open, candle));
        }
    }

    /// Settle the still-accumulating buckets at end of stream.
    ///
    /// `latest_base_open_ms` is the newest base open time that exists in the
    /// series at all, including beyond the stream that was fed.
    pub fn finish(&mut self, now_ms: i64, latest_base_open_ms: Option<i64>) {
        for i in 0..self.slots.len() {
            if let Some(bucket) = self.slots[i].current.take() {
                let end = bucket.open_time_ms + self.slots[i].target.duration_ms();
                let elapsed = end < now_ms || latest_base_open_ms.is_some_and(|t| t >= end);
                self.settle(i, bucket, elapsed);
            }
        }
    }

    fn settle(&mut self, slot: usize, bucket: Bucket, elapsed: bool) {
        let target = self.slots[slot].target;
        let expected = self.slots[slot].expected;
        let end = bucket.open_time_ms + target.duration_ms();
        let has_final = bucket.last_base_open_ms == end - self.base.duration_ms();

        let reason = match (has_final, elapsed) {
            (true, true) => None,
            (false, _) => Some(HoldReason::MissingFinal),
            (true, false) => Some(HoldReason::StillOpen),
        };
        if let Some(reason) = reason {
            debug!(series = %self.key, timeframe = %target, open_time_ms = bucket.open_time_ms, ?reason, "bucket held");
            self.held.push(HeldBucket {
                timeframe: target,
                open_time_ms: bucket.open_time_ms,
                reason,
            });
            return;
        }

        if bucket.count < expected {
            let gap = GapDetected {
                timeframe: target,
                open_time_ms: bucket.open_time_ms,
                present: bucket.count,
                expected,
            };
            warn!(series = %self.key, timeframe = %target, open_time_ms = gap.open_time_ms, present = gap.present, expected, "gap detected in base series");
            self.gaps.push(gap);
        }

        self.closed.push(Candle {
            venue: self.key.venue.clone(),
            symbol: self.key.symbol.clone(),
            timeframe: target,
            open_time_ms: bucket.open_time_ms,
            open: bucket.open,
            high: bucket.high,
            low: bucket.low,
            close: bucket.close,
            volume: bucket.volume,
        });
    }

    /// Closed candles produced since the last call, per timeframe ascending.
    pub fn take_closed(&mut self) -> Vec<Candle> {
        std::mem::take(&mut self.closed)
    }

    pub fn take_gaps(&mut self) -> Vec<GapDetected> {
        std::mem::take(&mut self.gaps)
    }

    pub fn take_held(&mut self) -> Vec<HeldBucket> {
        std::mem::take(&mut self.held)
    }
}

/// Roll a complete base slice up in one go.
pub fn aggregate_all(
    key: &SeriesKey,
    base: Timeframe,
    targets: &[Timeframe],
    candles: &[Candle],
    now_ms: i64,
) -> Result<(Vec<Candle>, Vec<GapDetected>), AggregateError> {
    let mut aggregator = Aggregator::new(key.clone(), base, targets)?;
    for candle in candles {
        aggregator.push(candle);
    }
    aggregator.finish(now_ms, candles.last().map(|c| c.open_time_ms));
    Ok((aggregator.take_closed(), aggregator.take_gaps()))
}
