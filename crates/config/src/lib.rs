//! Gatekeeper configuration structures to map the gatekeeper.toml configuration.

#![deny(missing_docs)]

mod loader;
mod rate_limit;
mod telemetry;

use std::path::Path;

pub use rate_limit::*;
use serde::Deserialize;
pub use telemetry::{ExportersConfig, OtlpExporterConfig, OtlpProtocol, TelemetryConfig};

/// Main configuration structure for the Gatekeeper application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Admission limits and storage backend.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Metrics export settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::{BackendFailurePolicy, Config, StorageConfig};

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        insta::assert_debug_snapshot!(&config.rate_limit, @r#"
        RateLimitConfig {
            enabled: true,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            tokens_per_minute: 100000,
            tokens_per_hour: 1000000,
            max_concurrent_requests: 10,
            per_user: true,
            burst_multiplier: 1.5,
            storage: Memory,
            require_user_id: false,
            fallback_to_session: true,
            on_backend_failure: Open,
            cleanup_interval: 60s,
        }
        "#);
    }

    #[test]
    fn all_values() {
        let config = indoc! {r#"
            [rate_limit]
            enabled = true
            requests_per_minute = 2
            requests_per_hour = 100
            tokens_per_minute = 5000
            tokens_per_hour = 50000
            max_concurrent_requests = 4
            per_user = false
            burst_multiplier = 1.0
            require_user_id = true
            fallback_to_session = false
            on_backend_failure = "closed"
            cleanup_interval = "30s"

            [rate_limit.storage]
            type = "redis"
            url = "redis://cache:6379/1"

            [telemetry]
            service_name = "gatekeeper"
        "#};

        let config: Config = toml::from_str(config).unwrap();
        let limits = &config.rate_limit;

        assert_eq!(limits.requests_per_minute, 2);
        assert_eq!(limits.requests_per_hour, 100);
        assert_eq!(limits.tokens_per_minute, 5000);
        assert_eq!(limits.tokens_per_hour, 50000);
        assert_eq!(limits.max_concurrent_requests, 4);
        assert!(!limits.per_user);
        assert_eq!(limits.burst_multiplier, 1.0);
        assert!(limits.require_user_id);
        assert!(!limits.fallback_to_session);
        assert_eq!(limits.on_backend_failure, BackendFailurePolicy::Closed);
        assert_eq!(limits.cleanup_interval, std::time::Duration::from_secs(30));
        assert!(matches!(&limits.storage, StorageConfig::Redis(redis) if redis.url == "redis://cache:6379/1"));
        assert_eq!(config.telemetry.service_name(), Some("gatekeeper"));

        config.validate().unwrap();
    }

    #[test]
    fn unknown_section_is_rejected() {
        let config = indoc! {r#"
            [server]
            listen_address = "127.0.0.1:8080"
        "#};

        let result: Result<Config, _> = toml::from_str(config);
        assert!(result.is_err());
    }
}
