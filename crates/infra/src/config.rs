//! Event bus configuration.
//!
//! Defaults work for a local Redis; `from_env` overrides them from
//! `EVENT_BUS_*` variables and `REDIS_URL`.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const DEFAULT_STREAM: &str = "agilebus:events";
pub const DEFAULT_GROUP: &str = "agilebus.consumers";
pub const DEFAULT_DLQ_STREAM: &str = "agilebus:events:dlq";
pub const DEFAULT_DLQ_GROUP: &str = "agilebus.consumers.dlq";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// When false, `connect` fails fast instead of dialing the broker.
    pub enabled: bool,
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    pub dlq_stream: String,
    pub dlq_group: String,
    /// Shared by publish attempts and per-message processing.
    pub retry: RetryPolicy,
    /// Used by `connect` only.
    pub connect_retry: RetryPolicy,
    /// Records claimed per read.
    pub batch_size: usize,
    /// How long a read waits for new records.
    pub block_timeout: Duration,
    /// Pause between disconnect and connect during a reconnect.
    pub reconnect_delay: Duration,
    /// Pause after a non-transport error inside a consumer loop.
    pub error_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            dlq_stream: DEFAULT_DLQ_STREAM.to_string(),
            dlq_group: DEFAULT_DLQ_GROUP.to_string(),
            retry: RetryPolicy::default(),
            connect_retry: RetryPolicy::exponential(
                3,
                Duration::from_secs(1),
                Duration::from_secs(30),
            ),
            batch_size: 10,
            block_timeout: Duration::from_millis(1000),
            reconnect_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl BusConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(enabled) = parsed::<bool>(&lookup, "EVENT_BUS_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(stream) = lookup("EVENT_BUS_STREAM") {
            config.stream = stream;
        }
        if let Some(group) = lookup("EVENT_BUS_GROUP") {
            config.dlq_group = format!("{group}.dlq");
            config.group = group;
        }
        if let Some(dlq) = lookup("EVENT_BUS_DLQ_STREAM") {
            config.dlq_stream = dlq;
        }
        if let Some(n) = parsed::<u32>(&lookup, "EVENT_BUS_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = seconds(&lookup, "EVENT_BUS_BASE_DELAY_SECS")? {
            config.retry.base_delay = secs;
        }
        if let Some(secs) = seconds(&lookup, "EVENT_BUS_MAX_DELAY_SECS")? {
            config.retry.max_delay = secs;
        }
        if let Some(base) = parsed::<f64>(&lookup, "EVENT_BUS_EXPONENTIAL_BASE")? {
            config.retry.exponential_base = base;
        }
        if let Some(n) = parsed::<usize>(&lookup, "EVENT_BUS_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "EVENT_BUS_BLOCK_TIMEOUT_MS")? {
            config.block_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.connect_retry.validate()?;
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        // A zero block on XREADGROUP waits forever and the stop flag is never seen.
        if self.block_timeout.is_zero() {
            return Err(ConfigError::Invalid("block_timeout must be greater than zero".into()));
        }
        if self.stream.is_empty() || self.group.is_empty() || self.dlq_stream.is_empty() {
            return Err(ConfigError::Invalid("stream and group names must not be empty".into()));
        }
        if self.stream == self.dlq_stream {
            return Err(ConfigError::Invalid(
                "dead-letter stream must differ from the main stream".into(),
            ));
        }
        Ok(())
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Env {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    parsed::<f64>(lookup, var)?
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Env {
                var,
                value: secs.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
