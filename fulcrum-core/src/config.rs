//! Recognized configuration keys (spec.md §6), loaded with sensible
//! defaults and overridable via `FULCRUM_*` environment variables.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FulcrumConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub registration_retry_delay_ms: u64,
    pub registration_max_attempts: u32,
    pub registration_timeout_ms: u64,
    pub dedup_ttl_seconds: u64,
    pub registration_dedup_ttl_seconds: u64,
    pub registry_record_ttl_seconds: u64,
    pub crash_detection_timeout_seconds: u64,
    pub metric_stale_seconds: u64,
}

impl Default for FulcrumConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 5000,
            registration_retry_delay_ms: 5000,
            registration_max_attempts: 5,
            registration_timeout_ms: 10_000,
            dedup_ttl_seconds: 60,
            registration_dedup_ttl_seconds: 30,
            registry_record_ttl_seconds: 120,
            crash_detection_timeout_seconds: 60,
            metric_stale_seconds: 10,
        }
    }
}

impl FulcrumConfig {
    /// Build configuration from defaults overlaid with `FULCRUM_*` environment
    /// variables (e.g. `FULCRUM_HEARTBEAT_INTERVAL_MS=3000`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::Environment::with_prefix("FULCRUM"));
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = FulcrumConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 2000);
        assert_eq!(cfg.registration_max_attempts, 5);
        assert_eq!(cfg.dedup_ttl_seconds, 60);
        assert_eq!(cfg.registration_dedup_ttl_seconds, 30);
        assert_eq!(cfg.registry_record_ttl_seconds, 120);
        assert_eq!(cfg.crash_detection_timeout_seconds, 60);
    }

    #[test]
    fn load_without_env_overrides_matches_defaults() {
        let cfg = FulcrumConfig::load().expect("config should build from defaults alone");
        assert_eq!(cfg, FulcrumConfig::default());
    }
}
