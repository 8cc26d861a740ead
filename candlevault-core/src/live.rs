//! Live ingestion interface.
//!
//! A live market-data client hands events here; they are folded into the
//! currently open base bucket and written through the same idempotent upsert
//! path as backfill. The open bucket is overwritten in place until a later
//! bucket starts. Live ingestion never touches coverage: only backfill can
//! vouch that a span is gapless.

use crate::domain::{Candle, SeriesKey, TimeRange};
use crate::store::{CandleStore, StoreError};
use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// A base-timeframe bar, possibly still forming.
    Bar(Candle),
    Trade {
        venue: String,
        symbol: String,
        ts_ms: i64,
        price: f64,
        quantity: f64,
    },
    /// Top of book; the mid price moves the bar, volume is untouched.
    Quote {
        venue: String,
        symbol: String,
        ts_ms: i64,
        bid: f64,
        ask: f64,
    },
}

pub struct LiveIngestor {
    store: Arc<dyn CandleStore>,
    base: Timeframe,
    open: HashMap<SeriesKey, Candle>,
}

impl LiveIngestor {
    pub fn new(store: Arc<dyn CandleStore>, base: Timeframe) -> Self {
        Self {
            store,
            base,
            open: HashMap::new(),
        }
    }

    /// The bar currently being built for `key`, if any.
    pub fn open_bar(&self, key: &SeriesKey) -> Option<&Candle> {
        self.open.get(key)
    }

    /// Apply one event. Returns the number of rows changed in the store.
    pub fn ingest(&mut self, event: LiveEvent) -> Result<usize, StoreError> {
        match event {
            LiveEvent::Bar(candle) => self.ingest_bar(candle),
            LiveEvent::Trade {
                venue,
                symbol,
                ts_ms,
                price,
                quantity,
            } => self.apply_tick(SeriesKey::new(venue, symbol), ts_ms, price, quantity),
            LiveEvent::Quote {
                venue,
                symbol,
                ts_ms,
                bid,
                ask,
            } => self.apply_tick(SeriesKey::new(venue, symbol), ts_ms, (bid + ask) / 2.0, 0.0),
        }
    }

    fn ingest_bar(&mut self, candle: Candle) -> Result<usize, StoreError> {
        if candle.timeframe != self.base {
            warn!(timeframe = %candle.timeframe, "live bar is not on the base timeframe, ignoring");
            return Ok(0);
        }
        let key = candle.key();
        let written = self.store.upsert_candles(std::slice::from_ref(&candle))?;
        let newer = self
            .open
            .get(&key)
            .map_or(true, |open| candle.open_time_ms >= open.open_time_ms);
        if newer {
            self.open.insert(key, candle);
        }
        Ok(written)
    }

    fn apply_tick(
        &mut self,
        key: SeriesKey,
        ts_ms: i64,
        price: f64,
        quantity: f64,
    ) -> Result<usize, StoreError> {
        if !price.is_finite() || price <= 0.0 || !quantity.is_finite() || quantity < 0.0 {
            warn!(series = %key, ts_ms, price, quantity, "dropping malformed tick");
            return Ok(0);
        }
        let bucket = self.base.floor(ts_ms);

        if !self.open.contains_key(&key) {
            // Resume a bar already in the store (e.g. written by backfill).
            let stored = self
                .store
                .read_candles(&key, self.base, TimeRange::new(bucket, bucket + self.base.duration_ms()))?;
            if let Some(candle) = stored.into_iter().next() {
                self.open.insert(key.clone(), candle);
            }
        }

        let bar = match self.open.remove(&key) {
            Some(bar) if bar.open_time_ms > bucket => {
                debug!(series = %key, ts_ms, "tick for an already closed bucket, ignoring");
                self.open.insert(key, bar);
                return Ok(0);
            }
            Some(mut bar) if bar.open_time_ms == bucket => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume += quantity;
                bar
            }
            _ => Candle {
                venue: key.venue.clone(),
                symbol: key.symbol.clone(),
                timeframe: self.base,
                open_time_ms: bucket,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: quantity,
            },
        };
        self.open.insert(key, bar.clone());
        self.store.upsert_candles(&[bar])
    }
}
