//! Application configuration, loaded from a single TOML file.
//!
//! ```toml
//! [data]
//! db_path = "data/candlevault.sqlite"
//!
//! [history]
//! market_data_venue = "binance_spot"
//! symbols = ["BTC/USDT", "ETH/USDT"]
//! start_date = "2017-08-17T00:00:00Z"
//! # end_date omitted: up to invocation time
//!
//! [aggregate]
//! timeframes = ["5m", "15m", "1h", "4h"]
//! ```

use crate::backfill::{BackfillRequest, RetryPolicy};
use crate::clock::{parse_timestamp_ms, EndBound, TimestampParseError};
use crate::repair::GapRepairConfig;
use crate::timeframe::{Timeframe, ONE_MINUTE};
use crate::venue::binance::{self, BinanceSpotVenue};
use crate::venue::{CircuitBreaker, FetchError, VenueRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Timestamp(#[from] TimestampParseError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data: DataConfig,
    pub history: HistoryConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub venues: BTreeMap<String, VenueConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_venue")]
    pub market_data_venue: String,
    pub symbols: Vec<String>,
    pub start_date: String,
    /// Absent means "up to invocation time".
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default = "default_chunk_days")]
    pub chunk_days: u32,
    #[serde(default = "default_base_timeframe")]
    pub base_timeframe: Timeframe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConfig {
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,
    #[serde(default = "default_chunk_days")]
    pub chunk_days: u32,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            chunk_days: default_chunk_days(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub max_gap_minutes: u32,
    pub chunk_minutes: u32,
    pub max_ranges: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        let d = GapRepairConfig::default();
        Self {
            max_gap_minutes: d.max_gap_minutes,
            chunk_minutes: d.chunk_minutes,
            max_ranges: d.max_ranges,
        }
    }
}

impl RepairConfig {
    pub fn settings(&self) -> GapRepairConfig {
        GapRepairConfig {
            max_gap_minutes: self.max_gap_minutes,
            chunk_minutes: self.chunk_minutes,
            max_ranges: self.max_ranges,
        }
    }
}

/// Per-venue endpoint override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default)]
    pub rest_url: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/candlevault.sqlite")
}

fn default_venue() -> String {
    binance::VENUE_ID.to_string()
}

fn default_chunk_days() -> u32 {
    7
}

fn default_base_timeframe() -> Timeframe {
    ONE_MINUTE
}

fn default_timeframes() -> Vec<Timeframe> {
    ["5m", "15m", "1h", "4h"]
        .iter()
        .filter_map(|s| Timeframe::parse(s).ok())
        .collect()
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.history;
        if h.symbols.is_empty() {
            return Err(ConfigError::Invalid("history.symbols is empty".into()));
        }
        if h.chunk_days == 0 || self.aggregate.chunk_days == 0 {
            return Err(ConfigError::Invalid("chunk_days must be at least 1".into()));
        }
        if self.repair.chunk_minutes == 0 || self.repair.max_ranges == 0 {
            return Err(ConfigError::Invalid(
                "repair.chunk_minutes and repair.max_ranges must be positive".into(),
            ));
        }
        let start = self.start_ms()?;
        if let EndBound::At(end) = self.end_bound()? {
            if end <= start {
                return Err(ConfigError::Invalid(format!(
                    "history.end_date ({}) is not after start_date ({})",
                    h.end_date.as_deref().unwrap_or_default(),
                    h.start_date
                )));
            }
        }
        for target in &self.aggregate.timeframes {
            target
                .buckets_of(h.base_timeframe)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn start_ms(&self) -> Result<i64, ConfigError> {
        Ok(parse_timestamp_ms(&self.history.start_date)?)
    }

    pub fn end_bound(&self) -> Result<EndBound, ConfigError> {
        let end = self
            .history
            .end_date
            .as_deref()
            .map(parse_timestamp_ms)
            .transpose()?;
        Ok(EndBound::from_option(end))
    }

    /// One request per configured symbol. `venue` and `symbols` override the
    /// config when given.
    pub fn backfill_requests(
        &self,
        venue: Option<&str>,
        symbols: &[String],
    ) -> Result<Vec<BackfillRequest>, ConfigError> {
        let venue = venue.unwrap_or(self.history.market_data_venue.as_str());
        let symbols = if symbols.is_empty() {
            self.history.symbols.as_slice()
        } else {
            symbols
        };
        let start = self.start_ms()?;
        let end = self.end_bound()?;
        Ok(symbols
            .iter()
            .map(|symbol| {
                BackfillRequest::new(venue, symbol.as_str(), start)
                    .with_end(end)
                    .with_chunk_days(self.history.chunk_days)
                    .with_base_timeframe(self.history.base_timeframe)
            })
            .collect())
    }

    pub fn rest_url(&self, venue: &str) -> Option<&str> {
        self.venues.get(venue).and_then(|v| v.rest_url.as_deref())
    }

    /// Registry with every network venue this build supports.
    pub fn venue_registry(&self) -> Result<VenueRegistry, FetchError> {
        let breaker = Arc::new(CircuitBreaker::default_venue(binance::VENUE_ID));
        let binance = BinanceSpotVenue::new(self.rest_url(binance::VENUE_ID), breaker)?;
        Ok(VenueRegistry::new().with(Arc::new(binance)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[history]
symbols = ["BTC/USDT"]
start_date = "2017-08-17T00:00:00Z"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(cfg.data.db_path, PathBuf::from("data/candlevault.sqlite"));
        assert_eq!(cfg.history.market_data_venue, "binance_spot");
        assert_eq!(cfg.history.chunk_days, 7);
        assert_eq!(cfg.history.base_timeframe, ONE_MINUTE);
        assert_eq!(cfg.end_bound().unwrap(), EndBound::Now);
        let labels: Vec<String> = cfg.aggregate.timeframes.iter().map(|t| t.label()).collect();
        assert_eq!(labels, ["5m", "15m", "1h", "4h"]);
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
        assert_eq!(cfg.repair.settings(), GapRepairConfig::default());
    }

    #[test]
    fn full_config_parses() {
        let cfg = AppConfig::from_toml(
            r#"
[data]
db_path = "/tmp/cv.sqlite"

[history]
market_data_venue = "binance_spot"
symbols = ["BTC/USDT", "ETH/USDT"]
start_date = "2024-01-01"
end_date = "2024-02-01T00:00:00Z"
chunk_days = 3

[aggregate]
timeframes = ["15m", "1d"]
chunk_days = 14

[retry]
max_retries = 2

[repair]
max_ranges = 10

[venues.binance_spot]
rest_url = "https://testnet.binance.vision"
"#,
        )
        .unwrap();
        assert_eq!(cfg.end_bound().unwrap(), EndBound::At(1_706_745_600_000));
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.repair.max_ranges, 10);
        assert_eq!(cfg.repair.chunk_minutes, 1000);
        assert_eq!(cfg.rest_url("binance_spot"), Some("https://testnet.binance.vision"));
        assert_eq!(cfg.rest_url("kraken"), None);

        let reqs = cfg.backfill_requests(None, &[]).unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].key.symbol, "ETH/USDT");
        assert_eq!(reqs[0].chunk_days, 3);
        assert_eq!(reqs[0].start_ms, 1_704_067_200_000);

        let reqs = cfg
            .backfill_requests(Some("mock"), &["SOL/USDT".to_string()])
            .unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].key.venue, "mock");
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "[history]\nsymbols = []\nstart_date = \"2024-01-01\"",
            "[history]\nsymbols = [\"BTC/USDT\"]\nstart_date = \"2024-01-01\"\nchunk_days = 0",
            "[history]\nsymbols = [\"BTC/USDT\"]\nstart_date = \"not a date\"",
            "[history]\nsymbols = [\"BTC/USDT\"]\nstart_date = \"2024-02-01\"\nend_date = \"2024-01-01\"",
            "[history]\nsymbols = [\"BTC/USDT\"]\nstart_date = \"2024-01-01\"\nbase_timeframe = \"5m\"\n[aggregate]\ntimeframes = [\"7m\"]",
            "[history]\nsymbols = [\"BTC/USDT\"]\nstart_date = \"2024-01-01\"\n[aggregate]\ntimeframes = [\"5x\"]",
        ];
        for case in cases {
            assert!(AppConfig::from_toml(case).is_err(), "accepted:\n{case}");
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = AppConfig::from_file(Path::new("/nonexistent/candlevault.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
