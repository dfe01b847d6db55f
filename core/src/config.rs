//! Pool configuration
//!
//! Configuration is fixed for the lifetime of a pool instance. It can be built
//! in code with the `with_*` setters or deserialized from JSON; missing fields
//! fall back to their defaults.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Range length at or below which tasks compute directly
pub const DEFAULT_LEAF_THRESHOLD: usize = 1000;

/// Upper bound on worker threads per pool
pub const MAX_PARALLELISM: usize = 1024;

/// Default idle park interval in microseconds
pub const DEFAULT_IDLE_PARK_MICROS: u64 = 200;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads
    pub parallelism: usize,
    /// Largest range length computed directly without splitting
    pub leaf_threshold: usize,
    /// Worker thread name prefix; the worker index is appended
    pub thread_name_prefix: String,
    /// Longest a worker parks before rescanning for work
    pub idle_park_micros: u64,
}

impl PoolConfig {
    /// Configuration with host-derived defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the leaf threshold
    pub fn with_leaf_threshold(mut self, leaf_threshold: usize) -> Self {
        self.leaf_threshold = leaf_threshold;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the idle park interval
    pub fn with_idle_park(mut self, idle_park: Duration) -> Self {
        self.idle_park_micros = idle_park.as_micros().min(u64::MAX as u128) as u64;
        self
    }

    /// Idle park interval as a duration
    pub fn idle_park(&self) -> Duration {
        Duration::from_micros(self.idle_park_micros.max(1))
    }

    /// Check the configuration for values a pool cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.parallelism == 0 {
            return Err(EngineError::InvalidConfig(
                "parallelism must be a positive integer".to_string(),
            ));
        }
        if self.parallelism > MAX_PARALLELISM {
            return Err(EngineError::InvalidConfig(format!(
                "parallelism {} exceeds the maximum of {}",
                self.parallelism, MAX_PARALLELISM
            )));
        }
        if self.leaf_threshold == 0 {
            return Err(EngineError::InvalidConfig(
                "leaf threshold must be a positive integer".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(EngineError::InvalidConfig(
                "thread name prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: PoolConfig = serde_json::from_str(json)
            .map_err(|error| EngineError::InvalidConfig(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a JSON document
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(|error| EngineError::InvalidConfig(error.to_string()))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            leaf_threshold: DEFAULT_LEAF_THRESHOLD,
            thread_name_prefix: "forkjoin-worker".to_string(),
            idle_park_micros: DEFAULT_IDLE_PARK_MICROS,
        }
    }
}

/// Number of hardware execution units, or 1 if it cannot be determined
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.parallelism >= 1);
        assert_eq!(config.leaf_threshold, DEFAULT_LEAF_THRESHOLD);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        let zero_workers = PoolConfig::new().with_parallelism(0);
        assert!(matches!(zero_workers.validate(), Err(EngineError::InvalidConfig(_))));

        let zero_threshold = PoolConfig::new().with_leaf_threshold(0);
        assert!(matches!(zero_threshold.validate(), Err(EngineError::InvalidConfig(_))));

        let too_many = PoolConfig::new().with_parallelism(MAX_PARALLELISM + 1);
        assert!(matches!(too_many.validate(), Err(EngineError::InvalidConfig(_))));

        let unnamed = PoolConfig::new().with_thread_name_prefix("");
        assert!(matches!(unnamed.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = PoolConfig::from_json(r#"{ "parallelism": 3 }"#).unwrap();
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.leaf_threshold, DEFAULT_LEAF_THRESHOLD);
        assert_eq!(config.thread_name_prefix, "forkjoin-worker");
    }

    #[test]
    fn test_from_json_validates() {
        let result = PoolConfig::from_json(r#"{ "leaf_threshold": 0 }"#);
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));

        let malformed = PoolConfig::from_json("{ parallelism: ");
        assert!(matches!(malformed, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_json_roundtrip_and_idle_park() {
        let config = PoolConfig::new()
            .with_parallelism(2)
            .with_leaf_threshold(64)
            .with_idle_park(Duration::from_millis(1));
        assert_eq!(config.idle_park(), Duration::from_millis(1));

        let json = config.to_json().unwrap();
        assert_eq!(PoolConfig::from_json(&json).unwrap(), config);
    }
}
