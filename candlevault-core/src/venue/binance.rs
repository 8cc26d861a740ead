//! Binance spot klines adapter.
//!
//! Pulls candles from `/api/v3/klines`, paginating 1000 rows at a time until
//! the window is exhausted. Each call is a single attempt per page; retry and
//! backoff happen one level up, per window, in the backfill engine.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{FetchError, VenueFetcher};
use crate::domain::{Candle, TimeRange};
use crate::timeframe::Timeframe;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_REST_URL: &str = "https://api.binance.com";
pub const VENUE_ID: &str = "binance_spot";

/// Maximum rows per klines request.
const PAGE_LIMIT: usize = 1000;

/// Intervals the klines endpoint accepts.
const INTERVALS: [&str; 15] = [
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
];

/// Binance error code for an unknown trading pair.
const INVALID_SYMBOL: i64 = -1121;

pub struct BinanceSpotVenue {
    client: reqwest::blocking::Client,
    rest_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BinanceSpotVenue {
    pub fn new(
        rest_url: Option<&str>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("candlevault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Rejected(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            rest_url: rest_url
                .unwrap_or(DEFAULT_REST_URL)
                .trim_end_matches('/')
                .to_string(),
            circuit_breaker,
        })
    }

    /// `BTC/USDT` → `BTCUSDT`.
    pub fn normalize_symbol(symbol: &str) -> String {
        symbol.replace(['/', '-', '_'], "").to_uppercase()
    }

    fn interval(timeframe: Timeframe) -> Result<String, FetchError> {
        let label = timeframe.label();
        if INTERVALS.contains(&label.as_str()) {
            Ok(label)
        } else {
            Err(FetchError::UnsupportedTimeframe {
                venue: VENUE_ID.to_string(),
                timeframe,
            })
        }
    }

    fn fetch_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Value, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitOpen);
        }

        let url = format!("{}/api/v3/klines", self.rest_url);
        let query = [
            ("symbol", Self::normalize_symbol(symbol)),
            ("interval", interval.to_string()),
            ("startTime", start_ms.to_string()),
            // endTime is inclusive on Binance
            ("endTime", (end_ms - 1).to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];

        let resp = self.client.get(&url).query(&query).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                FetchError::NetworkUnreachable(e.to_string())
            } else {
                FetchError::Upstream(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::IM_A_TEAPOT || status == StatusCode::FORBIDDEN {
            // IP ban
            self.circuit_breaker.trip();
            return Err(FetchError::CircuitOpen);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_failure();
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(FetchError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            self.circuit_breaker.record_failure();
            return Err(FetchError::Upstream(format!("HTTP {status} for {symbol}")));
        }

        let body = resp
            .text()
            .map_err(|e| FetchError::NetworkUnreachable(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_client_error(symbol, status, &body));
        }

        self.circuit_breaker.record_success();
        serde_json::from_str(&body)
            .map_err(|e| FetchError::MalformedResponse(format!("klines for {symbol}: {e}")))
    }
}

fn classify_client_error(symbol: &str, status: StatusCode, body: &str) -> FetchError {
    let code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(Value::as_i64));
    if code == Some(INVALID_SYMBOL) {
        return FetchError::UnknownSymbol {
            symbol: symbol.to_string(),
        };
    }
    let snippet: String = body.chars().take(200).collect();
    FetchError::Rejected(format!("HTTP {status}: {snippet}"))
}

fn number(row: &[Value], idx: usize) -> Result<f64, FetchError> {
    let field = row
        .get(idx)
        .ok_or_else(|| FetchError::MalformedResponse(format!("kline row missing field {idx}")))?;
    match field {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| FetchError::MalformedResponse(format!("field {idx}: {e}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FetchError::MalformedResponse(format!("field {idx} out of range"))),
        other => Err(FetchError::MalformedResponse(format!(
            "field {idx}: expected number, got {other}"
        ))),
    }
}

/// Parse a klines payload: an array of
/// `[openTime, open, high, low, close, volume, closeTime, ...]` rows.
pub fn parse_klines(
    venue: &str,
    symbol: &str,
    timeframe: Timeframe,
    payload: &Value,
) -> Result<Vec<Candle>, FetchError> {
    let rows = payload
        .as_array()
        .ok_or_else(|| FetchError::MalformedResponse("klines payload is not an array".into()))?;

    rows.iter()
        .map(|row| {
            let row = row
                .as_array()
                .ok_or_else(|| FetchError::MalformedResponse("kline row is not an array".into()))?;
            let open_time_ms = row.first().and_then(Value::as_i64).ok_or_else(|| {
                FetchError::MalformedResponse("kline row has no integer open time".into())
            })?;
            Ok(Candle {
                venue: venue.to_string(),
                symbol: symbol.to_string(),
                timeframe,
                open_time_ms,
                open: number(row, 1)?,
                high: number(row, 2)?,
                low: number(row, 3)?,
                close: number(row, 4)?,
                volume: number(row, 5)?,
            })
        })
        .collect()
}

impl VenueFetcher for BinanceSpotVenue {
    fn venue(&self) -> &str {
        VENUE_ID
    }

    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, FetchError> {
        let interval = Self::interval(timeframe)?;
        let mut out = Vec::new();
        let mut cursor = range.start_ms;

        while cursor < range.end_ms {
            let payload = self.fetch_page(symbol, &interval, cursor, range.end_ms)?;
            let page = parse_klines(VENUE_ID, symbol, timeframe, &payload)?;
            let Some(last) = page.last().map(|c| c.open_time_ms) else {
                break;
            };
            let full = page.len() >= PAGE_LIMIT;
            out.extend(page);

            let next = last + timeframe.duration_ms();
            if !full || next <= cursor {
                break;
            }
            cursor = next;
        }

        debug!(
            venue = VENUE_ID,
            symbol,
            %timeframe,
            %range,
            rows = out.len(),
            "fetched klines"
        );
        out.sort_by_key(|c| c.open_time_ms);
        Ok(out)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
