//! Venue fetch trait and structured error types.
//!
//! The VenueFetcher trait abstracts over upstream sources (Binance REST, a
//! scripted mock) so the backfill engine never branches on the exchange.

use crate::domain::{Candle, TimeRange};
use crate::timeframe::Timeframe;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Structured fetch errors, classified as retryable (transient) or not.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by venue (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("hard stop: venue has blocked requests (circuit breaker open)")]
    CircuitOpen,

    #[error("symbol not found: {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("no adapter registered for venue '{venue}'")]
    UnknownVenue { venue: String },

    #[error("timeframe {timeframe} not supported by {venue}")]
    UnsupportedTimeframe { venue: String, timeframe: Timeframe },

    #[error("response format changed: {0}")]
    MalformedResponse(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl FetchError {
    /// Transient failures are retried at window granularity; everything else
    /// aborts the (venue, symbol) run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::NetworkUnreachable(_)
                | FetchError::RateLimited { .. }
                | FetchError::Upstream(_)
        )
    }

    /// Minimum wait the venue asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// Pulls a bounded window of candles from one upstream source.
///
/// Implementations return candles sorted ascending by open time. They may
/// return fewer candles than the window holds (upstream gaps, the still-open
/// current bucket) and may return stray rows outside the window; the
/// backfill engine clips and validates.
pub trait VenueFetcher: Send + Sync {
    /// Venue identifier, e.g. `binance_spot`.
    fn venue(&self) -> &str;

    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, FetchError>;

    /// False while the venue refuses requests (e.g. circuit breaker open).
    fn is_available(&self) -> bool {
        true
    }
}

/// Venue id → adapter.
#[derive(Default, Clone)]
pub struct VenueRegistry {
    adapters: BTreeMap<String, Arc<dyn VenueFetcher>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn VenueFetcher>) -> &mut Self {
        self.adapters.insert(adapter.venue().to_string(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn VenueFetcher>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, venue: &str) -> Result<Arc<dyn VenueFetcher>, FetchError> {
        self.adapters
            .get(venue)
            .cloned()
            .ok_or_else(|| FetchError::UnknownVenue {
                venue: venue.to_string(),
            })
    }

    pub fn venues(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Dispatch a fetch to the adapter registered for `venue`.
    pub fn fetch(
        &self,
        venue: &str,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, FetchError> {
        self.get(venue)?
            .fetch(symbol, timeframe, TimeRange::new(start_ms, end_ms))
    }
}
