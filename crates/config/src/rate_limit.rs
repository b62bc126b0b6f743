//! Rate limiting configuration structures.

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Admission limits enforced by the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Maximum number of requests in a one minute window.
    pub requests_per_minute: u64,
    /// Maximum number of requests in a one hour window.
    pub requests_per_hour: u64,
    /// Maximum number of tokens consumed in a one minute window.
    pub tokens_per_minute: u64,
    /// Maximum number of tokens consumed in a one hour window.
    pub tokens_per_hour: u64,
    /// Maximum number of requests in flight at the same time.
    pub max_concurrent_requests: u64,
    /// Partition counters by caller. When false, every caller shares one global bucket.
    pub per_user: bool,
    /// Factor applied to every window limit to allow short bursts. Must be at least 1.0.
    pub burst_multiplier: f64,
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Reject callers that do not carry a user id.
    pub require_user_id: bool,
    /// Partition anonymous traffic by session id when no user id is present.
    pub fallback_to_session: bool,
    /// What to do when the distributed backend cannot be reached.
    pub on_backend_failure: BackendFailurePolicy,
    /// Minimum time between two sweeps of stale in-memory counters.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            tokens_per_minute: 100_000,
            tokens_per_hour: 1_000_000,
            max_concurrent_requests: 10,
            per_user: true,
            burst_multiplier: 1.5,
            storage: StorageConfig::default(),
            require_user_id: false,
            fallback_to_session: true,
            on_backend_failure: BackendFailurePolicy::default(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Checks the limits for values the rate limiter cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let limits = [
            ("requests_per_minute", self.requests_per_minute),
            ("requests_per_hour", self.requests_per_hour),
            ("tokens_per_minute", self.tokens_per_minute),
            ("tokens_per_hour", self.tokens_per_hour),
            ("max_concurrent_requests", self.max_concurrent_requests),
        ];

        for (name, value) in limits {
            if value == 0 {
                anyhow::bail!("rate_limit.{name} must be at least 1");
            }
        }

        if !self.burst_multiplier.is_finite() || self.burst_multiplier < 1.0 {
            anyhow::bail!(
                "rate_limit.burst_multiplier must be a finite number of at least 1.0, got {}",
                self.burst_multiplier
            );
        }

        if self.cleanup_interval.is_zero() {
            anyhow::bail!("rate_limit.cleanup_interval must not be zero");
        }

        if let StorageConfig::Redis(redis) = &self.storage {
            redis.validate()?;
        }

        Ok(())
    }
}

/// Behavior of the rate limiter when the distributed backend fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFailurePolicy {
    /// Fall back to the per-instance counters and keep admitting requests.
    #[default]
    Open,
    /// Reject requests until the backend is reachable again.
    Closed,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (default).
    #[default]
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

impl StorageConfig {
    /// Whether counters are shared between instances.
    pub fn is_distributed(&self) -> bool {
        matches!(self, StorageConfig::Redis(_))
    }
}

/// Redis storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// TLS configuration.
    pub tls: Option<RedisTlsConfig>,
    /// Key prefix for all rate limit keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Response timeout for Redis commands.
    #[serde(default = "default_response_timeout", deserialize_with = "deserialize_duration")]
    pub response_timeout: Duration,
    /// Connection timeout.
    #[serde(default = "default_connection_timeout", deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
    /// Expiry of the in-flight counter, releasing capacity held by crashed instances.
    #[serde(default = "default_concurrency_ttl", deserialize_with = "deserialize_duration")]
    pub concurrency_ttl: Duration,
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_concurrency_ttl() -> Duration {
    Duration::from_secs(300)
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/1".to_string(),
            pool: RedisPoolConfig::default(),
            tls: None,
            key_prefix: default_key_prefix(),
            response_timeout: default_response_timeout(),
            connection_timeout: default_connection_timeout(),
            concurrency_ttl: default_concurrency_ttl(),
        }
    }
}

impl RedisConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !(self.url.starts_with("redis://") || self.url.starts_with("rediss://")) {
            anyhow::bail!(
                "rate_limit.storage.url must start with redis:// or rediss://, got '{}'",
                self.url
            );
        }

        let timeouts = [
            ("response_timeout", self.response_timeout),
            ("connection_timeout", self.connection_timeout),
            ("concurrency_ttl", self.concurrency_ttl),
        ];

        for (name, value) in timeouts {
            if value.is_zero() {
                anyhow::bail!("rate_limit.storage.{name} must not be zero");
            }
        }

        if self.concurrency_ttl < Duration::from_secs(1) {
            anyhow::bail!(
                "rate_limit.storage.concurrency_ttl must be at least 1s, got {:?}",
                self.concurrency_ttl
            );
        }

        Ok(())
    }
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Redis TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Enable TLS (automatically enabled for rediss:// URLs).
    pub enabled: bool,
    /// Allow insecure connections (skip certificate validation).
    pub insecure: Option<bool>,
    /// Path to CA certificate file.
    pub ca_cert_path: Option<String>,
    /// Path to client certificate file (for mutual TLS).
    pub client_cert_path: Option<String>,
    /// Path to client key file (for mutual TLS).
    pub client_key_path: Option<String>,
}
