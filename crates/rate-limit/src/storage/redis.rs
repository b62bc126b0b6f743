//! Redis-based counter storage shared between instances.

use std::future::Future;
use std::time::Duration;

use config::RedisConfig;
use deadpool::managed::Object;
use redis::{RedisError, Script};
use telemetry::metrics::{RATE_LIMIT_BACKEND_DURATION, Recorder};

use super::redis_pool::{self, Manager, Pool};
use super::{CONCURRENCY_KEY, DistributedStore, Increment, StorageError, WINDOW_FAMILIES, is_counter_key};

/// Decrements without going below zero, in one server-side step.
const DECREMENT_SCRIPT: &str = r#"
local value = redis.call('DECR', KEYS[1])
if value < 0 then
  redis.call('SET', KEYS[1], 0)
  value = 0
end
return value
"#;

const SCAN_BATCH: usize = 500;

/// Redis-based rate limit storage implementation.
pub struct RedisStorage {
    /// Redis connection pool.
    pool: Pool,
    /// Key prefix for all rate limit keys.
    key_prefix: String,
    /// Response timeout for Redis commands.
    response_timeout: Duration,
    /// Timeout for getting a connection from the pool.
    connection_timeout: Duration,
    decrement: Script,
}

impl RedisStorage {
    /// Create a new Redis storage instance.
    ///
    /// The connection is established on first use, so an unreachable server does not prevent
    /// the service from starting.
    pub fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = redis_pool::create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        log::info!("Redis rate limit storage configured with key prefix '{}'", config.key_prefix);

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout,
            connection_timeout: config.connection_timeout,
            decrement: Script::new(DECREMENT_SCRIPT),
        })
    }

    fn key(&self, identifier: &str, window_key: &str) -> String {
        format!("{}{identifier}:{window_key}", self.key_prefix)
    }

    /// `MATCH` patterns covering the counters of one identifier, or every counter of the store.
    ///
    /// A pattern can still match identifiers that continue with `:{family}:{digit}`, so
    /// scanned keys go through [`Self::owns`] before they are deleted.
    fn scan_patterns(&self, identifier: Option<&str>) -> Vec<String> {
        let prefix = escape_glob(&self.key_prefix);

        match identifier {
            Some(identifier) => {
                let identifier = escape_glob(identifier);

                WINDOW_FAMILIES
                    .iter()
                    .map(|family| format!("{prefix}{identifier}:{family}:[0-9]*"))
                    .collect()
            }
            None => vec![format!("{prefix}*")],
        }
    }

    /// Whether a scanned key is a counter of exactly this identifier.
    fn owns(&self, identifier: Option<&str>, key: &str) -> bool {
        let Some(identifier) = identifier else {
            return true;
        };

        key.strip_prefix(self.key_prefix.as_str())
            .and_then(|rest| rest.strip_prefix(identifier))
            .and_then(|rest| rest.strip_prefix(':'))
            .is_some_and(is_counter_key)
    }

    async fn connection(&self) -> Result<Object<Manager>, StorageError> {
        match tokio::time::timeout(self.connection_timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StorageError::Connection(e.to_string())),
            Err(_) => Err(StorageError::Timeout(self.connection_timeout)),
        }
    }

    /// Runs one command against the server within the response timeout.
    async fn timed<T>(&self, command: impl Future<Output = Result<T, RedisError>>) -> Result<T, StorageError> {
        match tokio::time::timeout(self.response_timeout, command).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => Err(StorageError::Timeout(self.response_timeout)),
        }
    }

    fn recorder(operation: &'static str) -> Recorder {
        let mut recorder = Recorder::new(RATE_LIMIT_BACKEND_DURATION);
        recorder.push_attribute("operation", operation);
        recorder
    }
}

impl DistributedStore for RedisStorage {
    async fn increment(
        &self,
        identifier: &str,
        window_key: &str,
        ttl: Duration,
        amount: u64,
    ) -> Result<u64, StorageError> {
        let recorder = Self::recorder("increment");
        let key = self.key(identifier, window_key);
        let mut conn = self.connection().await?;

        let (count,): (u64,) = self
            .timed(
                redis::pipe()
                    .atomic()
                    .incr(&key, amount)
                    .pexpire(&key, ttl_millis(ttl))
                    .ignore()
                    .query_async(&mut *conn),
            )
            .await?;

        recorder.record();
        log::debug!("Incremented '{key}' by {amount} to {count}");

        Ok(count)
    }

    async fn increment_many(&self, identifier: &str, increments: &[Increment]) -> Result<Vec<u64>, StorageError> {
        if increments.is_empty() {
            return Ok(Vec::new());
        }

        let recorder = Self::recorder("increment_many");
        let mut pipe = redis::pipe();
        pipe.atomic();

        for increment in increments {
            let key = self.key(identifier, &increment.window_key);

            pipe.incr(&key, increment.amount)
                .pexpire(&key, ttl_millis(increment.ttl))
                .ignore();
        }

        let mut conn = self.connection().await?;
        let counts: Vec<u64> = self.timed(pipe.query_async(&mut *conn)).await?;

        recorder.record();
        log::debug!("Applied {} counter increments for '{identifier}'", increments.len());

        Ok(counts)
    }

    async fn get_count(&self, identifier: &str, window_key: &str) -> Result<u64, StorageError> {
        let recorder = Self::recorder("get");
        let key = self.key(identifier, window_key);
        let mut conn = self.connection().await?;

        let count: Option<u64> = self.timed(redis::cmd("GET").arg(&key).query_async(&mut *conn)).await?;

        recorder.record();
        Ok(count.unwrap_or(0))
    }

    async fn get_counts(&self, identifier: &str, window_keys: &[String]) -> Result<Vec<u64>, StorageError> {
        if window_keys.is_empty() {
            return Ok(Vec::new());
        }

        let recorder = Self::recorder("mget");
        let keys: Vec<String> = window_keys.iter().map(|window| self.key(identifier, window)).collect();
        let mut conn = self.connection().await?;

        let counts: Vec<Option<u64>> = self.timed(redis::cmd("MGET").arg(&keys).query_async(&mut *conn)).await?;

        recorder.record();
        Ok(counts.into_iter().map(|count| count.unwrap_or(0)).collect())
    }

    async fn get_concurrency(&self, identifier: &str) -> Result<u64, StorageError> {
        self.get_count(identifier, CONCURRENCY_KEY).await
    }

    async fn incr_concurrency(&self, identifier: &str, ttl: Duration) -> Result<u64, StorageError> {
        self.increment(identifier, CONCURRENCY_KEY, ttl, 1).await
    }

    async fn decr_concurrency(&self, identifier: &str) -> Result<u64, StorageError> {
        let recorder = Self::recorder("decrement");
        let key = self.key(identifier, CONCURRENCY_KEY);
        let mut conn = self.connection().await?;

        let count: u64 = self
            .timed(self.decrement.key(&key).invoke_async(&mut *conn))
            .await?;

        recorder.record();
        Ok(count)
    }

    async fn reset(&self, identifier: Option<&str>) -> Result<(), StorageError> {
        let recorder = Self::recorder("reset");
        let mut conn = self.connection().await?;
        let mut deleted = 0;

        if let Some(identifier) = identifier {
            let key = self.key(identifier, CONCURRENCY_KEY);
            deleted += self.timed(redis::cmd("DEL").arg(&key).query_async::<usize>(&mut *conn)).await?;
        }

        for pattern in self.scan_patterns(identifier) {
            let mut cursor: u64 = 0;

            loop {
                let (next, keys): (u64, Vec<String>) = self
                    .timed(
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(&pattern)
                            .arg("COUNT")
                            .arg(SCAN_BATCH)
                            .query_async(&mut *conn),
                    )
                    .await?;

                let keys: Vec<String> = keys.into_iter().filter(|key| self.owns(identifier, key)).collect();

                if !keys.is_empty() {
                    deleted += self
                        .timed(redis::cmd("DEL").arg(&keys).query_async::<usize>(&mut *conn))
                        .await?;
                }

                if next == 0 {
                    break;
                }

                cursor = next;
            }
        }

        recorder.record();
        log::debug!("Deleted {deleted} Redis keys of {}", identifier.unwrap_or("every identifier"));

        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
        log::debug!("Redis rate limit storage closed");
    }
}

impl From<RedisError> for StorageError {
    fn from(error: RedisError) -> Self {
        if error.is_connection_dropped() || error.is_connection_refusal() || error.is_io_error() {
            StorageError::Connection(error.to_string())
        } else {
            StorageError::Query(error.to_string())
        }
    }
}

/// Expiry in milliseconds for `PEXPIRE`. Never zero, which would delete the key.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Escapes the characters Redis treats specially in `MATCH` patterns.
fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_storage() -> RedisStorage {
        RedisStorage::new(&RedisConfig {
            url: "redis://127.0.0.1:1/0".to_string(),
            key_prefix: "test:".to_string(),
            response_timeout: Duration::from_millis(200),
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn keys_are_prefixed() {
        let storage = unreachable_storage();

        assert_eq!(storage.key("user123", "minute:28000000"), "test:user123:minute:28000000");
        assert_eq!(storage.key("session:abc", CONCURRENCY_KEY), "test:session:abc:concurrent");
    }

    #[tokio::test]
    async fn scan_patterns_escape_identifiers() {
        let storage = unreachable_storage();

        assert_eq!(
            storage.scan_patterns(Some("user*1")),
            [
                r"test:user\*1:minute:[0-9]*",
                r"test:user\*1:hour:[0-9]*",
                r"test:user\*1:tokens_minute:[0-9]*",
                r"test:user\*1:tokens_hour:[0-9]*",
            ]
        );
        assert_eq!(storage.scan_patterns(None), ["test:*"]);
    }

    #[tokio::test]
    async fn reset_of_an_identifier_spares_longer_identifiers() {
        let storage = unreachable_storage();

        assert!(storage.owns(Some("session"), &storage.key("session", "minute:28000000")));
        assert!(storage.owns(Some("session"), &storage.key("session", CONCURRENCY_KEY)));

        assert!(!storage.owns(Some("session"), &storage.key("session:abc", CONCURRENCY_KEY)));
        assert!(!storage.owns(Some("session"), &storage.key("session:abc", "minute:28000000")));
        assert!(!storage.owns(Some("session"), &storage.key("session:minute:5x", "hour:7")));
        assert!(!storage.owns(Some("u1"), &storage.key("u1:x", "tokens_hour:7")));

        assert!(storage.owns(None, &storage.key("session:abc", "minute:28000000")));
    }

    #[test]
    fn expiry_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_millis(500)), 500);
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
    }

    #[tokio::test]
    async fn unreachable_server_reports_errors() {
        let storage = unreachable_storage();

        assert!(storage.increment("u1", "minute:1", Duration::from_secs(120), 1).await.is_err());
        let batch = [Increment {
            window_key: "minute:1".to_string(),
            ttl: Duration::from_secs(120),
            amount: 1,
        }];
        assert!(storage.increment_many("u1", &batch).await.is_err());
        assert!(storage.get_count("u1", "minute:1").await.is_err());
        assert!(storage.decr_concurrency("u1").await.is_err());
        assert!(storage.reset(None).await.is_err());
    }
}
