//! Concurrency limit configuration
//!
//! Process-wide tunables, loaded once at startup. There is no runtime
//! mutation path; change them by redeploying.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConcurrencyLimitError;
use crate::store::DEFAULT_KEY_PREFIX;

/// Configuration for the concurrency limit middleware stack
///
/// # Example
///
/// ```
/// use everruns_concurrency_limit::ConcurrencyLimitConfig;
/// use std::time::Duration;
///
/// let config = ConcurrencyLimitConfig::default()
///     .with_max_batch_size(1000)
///     .with_loop_timeout(Duration::from_secs(60));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyLimitConfig {
    /// Namespace for every store key
    pub key_prefix: String,

    /// Upper bound on jobs drained per resume batch
    pub max_batch_size: usize,

    /// Wall-clock budget for one resume cycle
    #[serde(with = "duration_millis")]
    pub loop_timeout: Duration,

    /// Age after which an execution record is checked for liveness
    #[serde(with = "duration_millis")]
    pub tracking_ttl: Duration,

    /// Resume lease duration; must outlast `loop_timeout`
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// How often the maintenance scheduler runs
    #[serde(with = "duration_millis")]
    pub maintenance_interval: Duration,
}

impl Default for ConcurrencyLimitConfig {
    fn default() -> Self {
        let loop_timeout = Duration::from_secs(300);
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_batch_size: 5000,
            loop_timeout,
            tracking_ttl: Duration::from_secs(30),
            lease_ttl: loop_timeout + Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

impl ConcurrencyLimitConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (unset or unparsable values keep the default):
    /// - `CONCURRENCY_LIMIT_KEY_PREFIX`
    /// - `CONCURRENCY_LIMIT_MAX_BATCH_SIZE`
    /// - `CONCURRENCY_LIMIT_LOOP_TIMEOUT_MS`
    /// - `CONCURRENCY_LIMIT_TRACKING_TTL_MS`
    /// - `CONCURRENCY_LIMIT_LEASE_TTL_MS`
    /// - `CONCURRENCY_LIMIT_MAINTENANCE_INTERVAL_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(prefix) = env::var("CONCURRENCY_LIMIT_KEY_PREFIX") {
            if !prefix.is_empty() {
                config.key_prefix = prefix;
            }
        }
        if let Some(size) = env_parse::<usize>("CONCURRENCY_LIMIT_MAX_BATCH_SIZE") {
            config = config.with_max_batch_size(size);
        }
        if let Some(ms) = env_parse::<u64>("CONCURRENCY_LIMIT_LOOP_TIMEOUT_MS") {
            config.loop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CONCURRENCY_LIMIT_TRACKING_TTL_MS") {
            config.tracking_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CONCURRENCY_LIMIT_LEASE_TTL_MS") {
            config.lease_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CONCURRENCY_LIMIT_MAINTENANCE_INTERVAL_MS") {
            config.maintenance_interval = Duration::from_millis(ms);
        }

        config
    }

    /// Set the key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the maximum resume batch size
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Set the resume cycle budget
    pub fn with_loop_timeout(mut self, timeout: Duration) -> Self {
        self.loop_timeout = timeout;
        self
    }

    /// Set the execution record staleness grace period
    pub fn with_tracking_ttl(mut self, ttl: Duration) -> Self {
        self.tracking_ttl = ttl;
        self
    }

    /// Set the resume lease duration
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the maintenance interval
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConcurrencyLimitError> {
        if self.key_prefix.is_empty() {
            return Err(ConcurrencyLimitError::InvalidConfig(
                "key_prefix must not be empty".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConcurrencyLimitError::InvalidConfig(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.lease_ttl <= self.loop_timeout {
            return Err(ConcurrencyLimitError::InvalidConfig(
                "lease_ttl must be greater than loop_timeout".into(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConcurrencyLimitError::InvalidConfig(
                "maintenance_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConcurrencyLimitConfig::default();
        assert_eq!(config.key_prefix, "concurrency_limit");
        assert_eq!(config.max_batch_size, 5000);
        assert_eq!(config.loop_timeout, Duration::from_secs(300));
        assert!(config.lease_ttl > config.loop_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConcurrencyLimitConfig::new()
            .with_key_prefix("test")
            .with_max_batch_size(0)
            .with_loop_timeout(Duration::from_secs(10))
            .with_lease_ttl(Duration::from_secs(15))
            .with_tracking_ttl(Duration::from_secs(5));

        assert_eq!(config.key_prefix, "test");
        // Clamped to at least one
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.tracking_ttl, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lease_must_outlast_loop() {
        let config = ConcurrencyLimitConfig::new()
            .with_loop_timeout(Duration::from_secs(60))
            .with_lease_ttl(Duration::from_secs(60));
        assert!(matches!(
            config.validate(),
            Err(ConcurrencyLimitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_serde_durations_as_millis() {
        let config = ConcurrencyLimitConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["loop_timeout"], 300_000);

        let parsed: ConcurrencyLimitConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
