//! Storage backends for rate limiting.

use std::future::Future;
use std::time::Duration;

pub mod memory;
pub mod redis;
mod redis_pool;

pub use memory::{InMemoryStorage, LocalObservation};
pub use redis::RedisStorage;

/// Counter store shared by every instance of the service.
///
/// Implementations must perform increments atomically on the server side, so that no
/// client-side locking is needed across processes. Any connectivity, protocol or timeout
/// problem is reported as a [`StorageError`]; the rate limiter then answers the call from
/// its in-memory counters.
pub trait DistributedStore: Send + Sync {
    /// Adds `amount` to a window counter and refreshes its expiry. Returns the new value.
    fn increment(
        &self,
        identifier: &str,
        window_key: &str,
        ttl: Duration,
        amount: u64,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Applies several increments in one step: either all of them land or none does.
    /// Returns the new values in the order given.
    fn increment_many(
        &self,
        identifier: &str,
        increments: &[Increment],
    ) -> impl Future<Output = Result<Vec<u64>, StorageError>> + Send;

    /// Reads a window counter. Missing counters read as zero.
    fn get_count(&self, identifier: &str, window_key: &str) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Reads several counters of one identifier in a single round trip, in the order given.
    fn get_counts(
        &self,
        identifier: &str,
        window_keys: &[String],
    ) -> impl Future<Output = Result<Vec<u64>, StorageError>> + Send;

    /// Reads the number of requests in flight.
    fn get_concurrency(&self, identifier: &str) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Takes a concurrency slot. The counter expires after `ttl` unless touched again, so slots
    /// held by crashed instances are eventually given back.
    fn incr_concurrency(&self, identifier: &str, ttl: Duration) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Gives a concurrency slot back. The counter never goes below zero.
    fn decr_concurrency(&self, identifier: &str) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Deletes the counters of one identifier, or every counter of this store. Identifiers
    /// that merely start with the given one keep their counters.
    fn reset(&self, identifier: Option<&str>) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Releases the connections to the backend.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Key of the concurrency counter in the distributed store.
pub const CONCURRENCY_KEY: &str = "concurrent";

/// Window counter families of one identifier. Their keys are `{family}:{bucket}`.
pub const WINDOW_FAMILIES: [&str; 4] = ["minute", "hour", "tokens_minute", "tokens_hour"];

/// One counter update of a batch, see [`DistributedStore::increment_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    /// Window key, `{family}:{bucket}`.
    pub window_key: String,
    /// Expiry set on the counter.
    pub ttl: Duration,
    /// Amount added.
    pub amount: u64,
}

/// Whether `key` is one of the counters an identifier owns: the concurrency counter or
/// `{family}:{bucket}` with a numeric bucket.
pub fn is_counter_key(key: &str) -> bool {
    if key == CONCURRENCY_KEY {
        return true;
    }

    let Some((family, bucket)) = key.split_once(':') else {
        return false;
    };

    WINDOW_FAMILIES.contains(&family) && !bucket.is_empty() && bucket.bytes().all(|b| b.is_ascii_digit())
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Could not get a connection to the backend.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The backend rejected or failed a command.
    #[error("Query error: {0}")]
    Query(String),
    /// The backend did not answer in time.
    #[error("Backend did not respond within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_keys() {
        assert!(is_counter_key("concurrent"));
        assert!(is_counter_key("minute:29000000"));
        assert!(is_counter_key("tokens_hour:483"));

        assert!(!is_counter_key("minute:"));
        assert!(!is_counter_key("minute:5x"));
        assert!(!is_counter_key("abc:minute:29000000"));
        assert!(!is_counter_key("abc:concurrent"));
        assert!(!is_counter_key("seconds:12"));
    }
}
