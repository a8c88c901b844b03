//! # Engine Configuration
//!
//! Layered configuration for the run engine: defaults, an optional
//! `conductor.yaml`, then `CONDUCTOR_*` environment variables, each layer
//! overriding the previous one.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Environment variable prefix for configuration overrides
const ENV_PREFIX: &str = "CONDUCTOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Postgres connection string for the persistence layer
    pub database_url: String,
    /// Base URL injected into task callback commands
    pub callback_base_url: String,
    /// Bounded fan-out ceiling shared by DAG dispatch and bulk recovery
    pub max_concurrent_branches: usize,
    /// Run-level watchdog ceiling
    pub run_timeout_seconds: u64,
    /// Per-task timeout applied when a definition declares none
    pub default_task_timeout_seconds: u64,
    /// First polling delay while a task is running
    pub poll_initial_interval_ms: u64,
    /// Polling delay growth per iteration
    pub poll_interval_step_ms: u64,
    /// Polling delay ceiling
    pub poll_max_interval_ms: u64,
    /// Attempts made to obtain a tunnel dialer before failing dispatch
    pub dialer_retry_attempts: u32,
    /// Delay between tunnel dial attempts
    pub dialer_retry_delay_seconds: u64,
    /// Capacity of the actuator client cache
    pub actuator_cache_capacity: usize,
    /// Capacity of the lifecycle event channel
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/conductor_development".to_string(),
            callback_base_url: "http://localhost:8080".to_string(),
            max_concurrent_branches: 10,
            run_timeout_seconds: 24 * 60 * 60,
            default_task_timeout_seconds: 3600,
            poll_initial_interval_ms: 1_000,
            poll_interval_step_ms: 2_000,
            poll_max_interval_ms: 10_000,
            dialer_retry_attempts: 10,
            dialer_retry_delay_seconds: 5,
            actuator_cache_capacity: 64,
            event_channel_capacity: 1_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// Missing files are fine; `CONDUCTOR_DATABASE_URL` etc. always win.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        let loaded = builder
            .build()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        let mut config = Self::default();
        config.apply(&loaded)?;
        Ok(config)
    }

    fn apply(&mut self, source: &config::Config) -> Result<()> {
        macro_rules! override_field {
            ($field:ident, $key:expr, $ty:ty) => {
                if let Ok(value) = source.get::<$ty>($key) {
                    self.$field = value;
                }
            };
        }
        override_field!(database_url, "database_url", String);
        override_field!(callback_base_url, "callback_base_url", String);
        override_field!(max_concurrent_branches, "max_concurrent_branches", usize);
        override_field!(run_timeout_seconds, "run_timeout_seconds", u64);
        override_field!(
            default_task_timeout_seconds,
            "default_task_timeout_seconds",
            u64
        );
        override_field!(poll_initial_interval_ms, "poll_initial_interval_ms", u64);
        override_field!(poll_interval_step_ms, "poll_interval_step_ms", u64);
        override_field!(poll_max_interval_ms, "poll_max_interval_ms", u64);
        override_field!(dialer_retry_attempts, "dialer_retry_attempts", u32);
        override_field!(
            dialer_retry_delay_seconds,
            "dialer_retry_delay_seconds",
            u64
        );
        override_field!(actuator_cache_capacity, "actuator_cache_capacity", usize);
        override_field!(event_channel_capacity, "event_channel_capacity", usize);
        Ok(())
    }

    /// Configuration tuned for fast tests: millisecond polling, short ceilings
    pub fn for_testing() -> Self {
        Self {
            max_concurrent_branches: 4,
            run_timeout_seconds: 10,
            default_task_timeout_seconds: 5,
            poll_initial_interval_ms: 5,
            poll_interval_step_ms: 5,
            poll_max_interval_ms: 20,
            dialer_retry_attempts: 2,
            dialer_retry_delay_seconds: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_branches, 10);
        assert_eq!(config.run_timeout_seconds, 86_400);
        assert_eq!(config.default_task_timeout_seconds, 3_600);
        assert_eq!(config.poll_initial_interval_ms, 1_000);
        assert_eq!(config.poll_max_interval_ms, 10_000);
        assert_eq!(config.dialer_retry_attempts, 10);
        assert_eq!(config.dialer_retry_delay_seconds, 5);
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("CONDUCTOR_MAX_CONCURRENT_BRANCHES", "3");
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.max_concurrent_branches, 3);
        std::env::remove_var("CONDUCTOR_MAX_CONCURRENT_BRANCHES");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load(Some("does-not-exist")).unwrap();
        assert_eq!(config.run_timeout_seconds, 86_400);
    }
}
