//! Session configuration.

#[cfg(feature = "config-file")]
use serde::{Deserialize, Serialize};

use crate::core::{
    DEFAULT_BANDWIDTH_LIMIT, DEFAULT_POLL_CAPACITY, ENV_BANDWIDTH_LIMIT, ENV_FAULT_TOLERANT,
    ENV_POLL_CAPACITY, MigrationError, MigrationResult,
};

/// Configuration of a [`MigrationSession`](crate::migration::MigrationSession).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct MigrationConfig {
    /// Readiness events fetched per poll.
    pub poll_capacity: usize,

    /// Bandwidth limit (bytes per second) for outgoing attempts that
    /// don't set one.
    pub default_bandwidth_limit: u64,

    /// Receive incoming migrations in fault-tolerant mode.
    pub fault_tolerant: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_capacity: DEFAULT_POLL_CAPACITY,
            default_bandwidth_limit: DEFAULT_BANDWIDTH_LIMIT,
            fault_tolerant: false,
        }
    }
}

impl MigrationConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> MigrationConfigBuilder {
        MigrationConfigBuilder::new()
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `MIGRATION_POLL_CAPACITY`: events fetched per poll
    /// - `MIGRATION_BANDWIDTH_LIMIT`: default outgoing limit in bytes/s
    /// - `MIGRATION_FT`: "1" or "true" for fault-tolerant receive
    ///
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            poll_capacity: lookup(ENV_POLL_CAPACITY)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.poll_capacity),
            default_bandwidth_limit: lookup(ENV_BANDWIDTH_LIMIT)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.default_bandwidth_limit),
            fault_tolerant: lookup(ENV_FAULT_TOLERANT)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.fault_tolerant),
        }
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    #[cfg(feature = "config-file")]
    #[cfg_attr(docsrs, doc(cfg(feature = "config-file")))]
    pub fn from_toml_str(text: &str) -> MigrationResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| MigrationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the session can't run with.
    pub fn validate(&self) -> MigrationResult<()> {
        if self.poll_capacity == 0 {
            return Err(MigrationError::Config(
                "poll_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`MigrationConfig`].
#[derive(Debug, Default)]
pub struct MigrationConfigBuilder {
    config: MigrationConfig,
}

impl MigrationConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of readiness events fetched per poll.
    pub fn poll_capacity(mut self, capacity: usize) -> Self {
        self.config.poll_capacity = capacity;
        self
    }

    /// Set the default outgoing bandwidth limit (bytes per second).
    pub fn default_bandwidth_limit(mut self, limit: u64) -> Self {
        self.config.default_bandwidth_limit = limit;
        self
    }

    /// Enable or disable fault-tolerant receive.
    pub fn fault_tolerant(mut self, enabled: bool) -> Self {
        self.config.fault_tolerant = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> MigrationConfig {
        self.config
    }
}
