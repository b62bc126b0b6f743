//! Admission control for LLM traffic.
//!
//! Every caller is identified by a user id, a session id, or as anonymous, and is held to:
//! - requests per minute and per hour
//! - tokens per minute and per hour
//! - requests in flight
//!
//! Counters live in memory, or in Redis when several instances must share them. When Redis
//! fails the limiter keeps answering from its in-memory counters, or rejects requests if it
//! is configured to fail closed.

#![deny(missing_docs)]

mod error;
mod identifier;
mod limiter;
mod observer;
mod slot;
mod storage;
mod usage;
mod window;

pub use error::RateLimitError;
pub use identifier::{ANONYMOUS, Identifier, IdentifierResolver};
pub use limiter::{GLOBAL_KEY, RateLimiter};
pub use observer::{MetricsObserver, NoopObserver, RateLimitObserver};
pub use slot::ConcurrencySlot;
pub use storage::{
    CONCURRENCY_KEY, DistributedStore, InMemoryStorage, Increment, LocalObservation, RedisStorage, StorageError,
    WINDOW_FAMILIES, is_counter_key,
};
pub use usage::{Usage, UsageSnapshot};
pub use window::{Window, WindowState, ceiling};
