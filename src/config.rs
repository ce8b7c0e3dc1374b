//! Pipeline configuration
//!
//! Instrument list, retention window, generator tick, sync interval and the
//! reader defaults. Loaded from an optional TOML file, then overridden from
//! the environment, then validated. Any failure here is fatal at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::clock::{MILLIS_PER_MINUTE, MILLIS_PER_SEC};
use crate::error::PipelineError;
use crate::models::Instrument;

const DEFAULT_CONFIG_PATH: &str = "pricestream.toml";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fixed, ordered instrument list
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,

    /// How long samples stay in the volatile cache (minutes)
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,

    /// Generator tick period (ms)
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Pause between durable sync cycles (seconds)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// History window served when a reader gives no bounds (minutes)
    #[serde(default = "default_history_lookback_minutes")]
    pub history_lookback_minutes: u64,

    /// Poll interval advertised to readers (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-instrument notification channel capacity
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Reader sessions idle for longer than this are dropped (seconds)
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_instruments() -> Vec<Instrument> {
    vec![
        Instrument::new("ticker_999", "Tesla"),
        Instrument::new("ticker_998", "Gold"),
        Instrument::new("ticker_997", "Apple"),
    ]
}

fn default_retention_minutes() -> u64 {
    5
}

fn default_tick_period_ms() -> u64 {
    1_000
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_history_lookback_minutes() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_notify_capacity() -> usize {
    1024
}

fn default_database_path() -> String {
    "pricestream.db".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8050".to_string()
}

fn default_session_idle_secs() -> u64 {
    900
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instruments: default_instruments(),
            retention_minutes: default_retention_minutes(),
            tick_period_ms: default_tick_period_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            history_lookback_minutes: default_history_lookback_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
            notify_capacity: default_notify_capacity(),
            database_path: default_database_path(),
            listen_addr: default_listen_addr(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, PipelineError> {
        toml::from_str(contents).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// File (`PRICESTREAM_CONFIG`, else `pricestream.toml` when present, else
    /// defaults), then environment overrides, then validation.
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut config = match std::env::var("PRICESTREAM_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::load(path.trim())?,
            _ if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            _ => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = get("TRADING_INSTRUMENTS") {
            self.instruments = parse_instrument_list(&raw)?;
        }
        if let Some(raw) = get("RETENTION_PERIOD_MINUTES") {
            self.retention_minutes = parse_number("RETENTION_PERIOD_MINUTES", &raw)?;
        }
        if let Some(raw) = get("TICK_PERIOD_MS") {
            self.tick_period_ms = parse_number("TICK_PERIOD_MS", &raw)?;
        }
        if let Some(raw) = get("SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = parse_number("SYNC_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = get("DB_PATH") {
            self.database_path = raw.trim().to_string();
        }
        if let Some(raw) = get("LISTEN_ADDR") {
            self.listen_addr = raw.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.instruments.is_empty() {
            return Err(PipelineError::Configuration(
                "instrument list is empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "instrument id must not be blank".to_string(),
                ));
            }
            if !seen.insert(instrument.id.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate instrument id: {}",
                    instrument.id
                )));
            }
        }

        if self.retention_minutes == 0 {
            return Err(PipelineError::Configuration(
                "retention period must be positive".to_string(),
            ));
        }
        if self.tick_period_ms == 0 {
            return Err(PipelineError::Configuration(
                "tick period must be positive".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(PipelineError::Configuration(
                "sync interval must be positive".to_string(),
            ));
        }
        if self.tick_period_ms as i64 > self.retention_ms() {
            return Err(PipelineError::Configuration(format!(
                "tick period {}ms exceeds retention window {}ms",
                self.tick_period_ms,
                self.retention_ms()
            )));
        }
        Ok(())
    }

    pub fn instrument_ids(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.id.clone()).collect()
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_minutes as i64 * MILLIS_PER_MINUTE
    }

    pub fn history_lookback_ms(&self) -> i64 {
        self.history_lookback_minutes as i64 * MILLIS_PER_MINUTE
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_secs * MILLIS_PER_SEC as u64)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// Parse `id:name,id:name`; a bare `id` uses the id as its display name.
pub fn parse_instrument_list(raw: &str) -> Result<Vec<Instrument>, PipelineError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((id, name)) if !id.trim().is_empty() => {
                let name = if name.trim().is_empty() { id } else { name };
                Ok(Instrument::new(id.trim(), name.trim()))
            }
            Some(_) => Err(PipelineError::Configuration(format!(
                "instrument entry '{}' has no id",
                entry
            ))),
            None => Ok(Instrument::new(entry, entry)),
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, PipelineError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| PipelineError::Configuration(format!("{} is not a number: {}", key, raw)))
}
