//! Venue fetch adapters
//!
//! Each exchange's request/response shape sits behind [`VenueFetcher`]; the
//! engines only ever see candles and a retry classification.

pub mod binance;
pub mod circuit_breaker;
pub mod mock;
pub mod provider;

pub use binance::BinanceSpotVenue;
pub use circuit_breaker::CircuitBreaker;
pub use mock::MockVenue;
pub use provider::{FetchError, VenueFetcher, VenueRegistry};
