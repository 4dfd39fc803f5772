//! Runtime configuration, read from the environment.
//!
//! Durations accept plain seconds (`30`) or suffixed values (`500ms`, `30s`,
//! `5m`, `1h`).

use crate::cache::CoalescerConfig;
use crate::presence::PresenceThresholds;
use anyhow::{Context, Result, ensure};
use figment::Figment;
use figment::providers::Env;
use fundu::DurationParser;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Postgres connection string. Without it sessions are kept in memory.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_shutdown_timeout", deserialize_with = "duration")]
    pub shutdown_timeout: Duration,

    #[serde(default = "default_online_within", deserialize_with = "duration")]
    pub presence_online_within: Duration,
    #[serde(default = "default_away_within", deserialize_with = "duration")]
    pub presence_away_within: Duration,

    /// Backend the `agent` command talks to.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_cache_ttl", deserialize_with = "duration")]
    pub cache_default_ttl: Duration,
    #[serde(default = "default_cache_min_interval", deserialize_with = "duration")]
    pub cache_min_interval: Duration,
    #[serde(default = "default_cache_max_concurrent")]
    pub cache_max_concurrent: usize,
    #[serde(default = "default_cache_fetch_timeout", deserialize_with = "duration")]
    pub cache_fetch_timeout: Duration,
    #[serde(default = "default_cache_lock_idle", deserialize_with = "duration")]
    pub cache_lock_idle: Duration,
    #[serde(default = "default_heartbeat_interval", deserialize_with = "duration")]
    pub heartbeat_interval: Duration,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_online_within() -> Duration {
    Duration::from_secs(30)
}

fn default_away_within() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cache_min_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_cache_max_concurrent() -> usize {
    4
}

fn default_cache_fetch_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_cache_lock_idle() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

impl Config {
    /// Load from raw environment variables (`LOG_LEVEL`, `PORT`, ...).
    pub fn load() -> Result<Self> {
        Self::from_figment(Figment::new().merge(Env::raw()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("Failed to load config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.presence_online_within < self.presence_away_within,
            "PRESENCE_ONLINE_WITHIN ({:?}) must be shorter than PRESENCE_AWAY_WITHIN ({:?})",
            self.presence_online_within,
            self.presence_away_within
        );
        ensure!(
            self.cache_max_concurrent >= 1,
            "CACHE_MAX_CONCURRENT must be at least 1"
        );
        ensure!(
            !self.heartbeat_interval.is_zero(),
            "HEARTBEAT_INTERVAL must be positive"
        );
        Ok(())
    }

    pub fn presence_thresholds(&self) -> PresenceThresholds {
        PresenceThresholds {
            online_within: self.presence_online_within,
            away_within: self.presence_away_within,
        }
    }

    pub fn coalescer(&self) -> CoalescerConfig {
        CoalescerConfig {
            min_interval: self.cache_min_interval,
            max_concurrent: self.cache_max_concurrent,
            default_timeout: self.cache_fetch_timeout,
        }
    }
}

/// Parse `30`, `30s`, `5m`, `250ms` and friends.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let parsed = DurationParser::with_all_time_units()
        .parse(value.trim())
        .map_err(|e| format!("invalid duration {value:?}: {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration {value:?}: {e}"))
}

fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
