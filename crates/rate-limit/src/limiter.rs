//! Admission control over the local and distributed counters.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use config::{BackendFailurePolicy, RateLimitConfig, StorageConfig};
use tokio::time::Instant;

use crate::error::RateLimitError;
use crate::identifier::{Identifier, IdentifierResolver};
use crate::observer::{MetricsObserver, RateLimitObserver};
use crate::slot::{ConcurrencySlot, SlotHolder};
use crate::storage::{
    CONCURRENCY_KEY, DistributedStore, InMemoryStorage, Increment, RedisStorage, StorageError, WINDOW_FAMILIES,
};
use crate::usage::{Usage, UsageSnapshot};
use crate::window::{Window, WindowState, ceiling};

/// Bucket used by every caller when limits are not partitioned per user.
pub const GLOBAL_KEY: &str = "global";

/// Retry hint for rejections that do not end with a window.
const SHORT_RETRY: Duration = Duration::from_secs(1);

/// Used for the in-flight counter when the configuration has no Redis section.
const DEFAULT_CONCURRENCY_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
enum CounterKind {
    Requests,
    Tokens,
}

/// Ceilings of every dimension, burst allowance included.
#[derive(Debug, Clone, Copy)]
struct Ceilings {
    requests_minute: u64,
    requests_hour: u64,
    tokens_minute: u64,
    tokens_hour: u64,
    concurrent: u64,
}

impl Ceilings {
    fn new(config: &RateLimitConfig) -> Self {
        let burst = config.burst_multiplier;

        Self {
            requests_minute: ceiling(config.requests_per_minute, burst),
            requests_hour: ceiling(config.requests_per_hour, burst),
            tokens_minute: ceiling(config.tokens_per_minute, burst),
            tokens_hour: ceiling(config.tokens_per_hour, burst),
            concurrent: config.max_concurrent_requests,
        }
    }

    fn requests(&self, window: Window) -> u64 {
        match window {
            Window::Minute => self.requests_minute,
            Window::Hour => self.requests_hour,
        }
    }

    fn tokens(&self, window: Window) -> u64 {
        match window {
            Window::Minute => self.tokens_minute,
            Window::Hour => self.tokens_hour,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    count: u64,
    tokens: u64,
    retry_after: Duration,
}

impl Reading {
    fn local(state: &WindowState, window: Window, now: Instant) -> Self {
        Self {
            count: state.count,
            tokens: state.tokens,
            retry_after: state.retry_after(window, now),
        }
    }
}

/// Counters of one identifier as seen by a single check.
#[derive(Debug, Clone, Copy)]
struct Observation {
    concurrent: u64,
    minute: Reading,
    hour: Reading,
}

impl Observation {
    fn window(&self, window: Window) -> &Reading {
        match window {
            Window::Minute => &self.minute,
            Window::Hour => &self.hour,
        }
    }
}

pub(crate) struct Inner<S> {
    pub(crate) config: RateLimitConfig,
    ceilings: Ceilings,
    resolver: IdentifierResolver,
    pub(crate) local: InMemoryStorage,
    pub(crate) distributed: Option<S>,
    pub(crate) observer: Arc<dyn RateLimitObserver>,
    concurrency_ttl: Duration,
}

/// Enforces request, token and concurrency limits per caller.
///
/// The limiter is cheap to clone; clones share their counters. Create one at startup, hand
/// it to the request handlers, and [`close`](Self::close) it on shutdown.
///
/// A request goes through [`check`](Self::check) (or [`admit`](Self::admit) which also takes a
/// concurrency slot), runs, and is then accounted with [`record`](Self::record). Checking never
/// counts the request, so it can be used to probe limits without consuming them.
pub struct RateLimiter<S = RedisStorage> {
    pub(crate) inner: Arc<Inner<S>>,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RateLimiter {
    /// Create a rate limiter with the storage backend from the configuration.
    ///
    /// Redis connections are opened lazily, an unreachable server is not an error here.
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::with_observer(config, Arc::new(MetricsObserver::new()))
    }

    /// Like [`Self::new`], reporting decisions to the given observer.
    pub fn with_observer(config: RateLimitConfig, observer: Arc<dyn RateLimitObserver>) -> Result<Self, RateLimitError> {
        validate(&config)?;

        let store = match &config.storage {
            StorageConfig::Memory => None,
            StorageConfig::Redis(redis) => Some(RedisStorage::new(redis)?),
        };

        Self::from_parts(config, store, observer)
    }
}

impl<S: DistributedStore + 'static> RateLimiter<S> {
    /// Create a rate limiter sharing its counters through the given store.
    pub fn with_store(
        config: RateLimitConfig,
        store: S,
        observer: Arc<dyn RateLimitObserver>,
    ) -> Result<Self, RateLimitError> {
        Self::from_parts(config, Some(store), observer)
    }

    fn from_parts(
        config: RateLimitConfig,
        distributed: Option<S>,
        observer: Arc<dyn RateLimitObserver>,
    ) -> Result<Self, RateLimitError> {
        validate(&config)?;

        let concurrency_ttl = match &config.storage {
            StorageConfig::Redis(redis) => redis.concurrency_ttl,
            StorageConfig::Memory => DEFAULT_CONCURRENCY_TTL,
        };

        log::info!(
            "Rate limiter initialized: enabled={}, requests_per_minute={}, tokens_per_minute={}, max_concurrent={}, distributed={}",
            config.enabled,
            config.requests_per_minute,
            config.tokens_per_minute,
            config.max_concurrent_requests,
            distributed.is_some(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                ceilings: Ceilings::new(&config),
                resolver: IdentifierResolver::new(&config),
                local: InMemoryStorage::new(),
                distributed,
                observer,
                concurrency_ttl,
                config,
            }),
        })
    }

    /// The configuration the limiter was built with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Whether counters are shared with other instances.
    pub fn is_distributed(&self) -> bool {
        self.inner.distributed.is_some()
    }

    /// Derives the identifier of a caller, see [`IdentifierResolver::resolve`].
    pub fn resolve(&self, user_id: Option<&str>, session_id: Option<&str>) -> Result<Identifier, RateLimitError> {
        self.inner.resolver.resolve(user_id, session_id)
    }

    /// Checks every limit without counting the request.
    ///
    /// Limits are evaluated in this order: in-flight requests, requests per minute, requests
    /// per hour, then the token budgets per minute and per hour when `estimated_tokens` is
    /// not zero. The first exhausted limit is returned.
    pub async fn check(&self, identifier: &Identifier, estimated_tokens: u64) -> Result<(), RateLimitError> {
        if !self.inner.config.enabled {
            return Ok(());
        }

        let result = self.decide(identifier, estimated_tokens).await;
        self.report(identifier, result.as_ref().map(|_| ()));

        result
    }

    /// Checks every limit and takes a concurrency slot if they pass.
    ///
    /// The comparison against the concurrency cap and the increment happen as one step, so
    /// concurrent callers can not overshoot the cap.
    pub async fn admit(
        &self,
        identifier: &Identifier,
        estimated_tokens: u64,
    ) -> Result<ConcurrencySlot<S>, RateLimitError> {
        if !self.inner.config.enabled {
            return Ok(ConcurrencySlot::inert());
        }

        let result = match self.decide(identifier, estimated_tokens).await {
            Ok(()) => self.acquire_bounded(identifier).await,
            Err(error) => Err(error),
        };

        self.report(identifier, result.as_ref().map(|_| ()));

        result
    }

    /// Counts a finished request and the tokens it used. Never rejects.
    pub async fn record(&self, identifier: &Identifier, tokens_used: u64) {
        if !self.inner.config.enabled {
            return;
        }

        let key = self.scope(identifier);

        let recorded = match &self.inner.distributed {
            Some(store) => match record_distributed(store, key, tokens_used).await {
                Ok(()) => true,
                Err(error) => {
                    self.degraded("record", &error);
                    false
                }
            },
            None => false,
        };

        if !recorded {
            self.inner.local.increment(key, 1, tokens_used);
        }

        log::debug!("Recorded request for '{key}' with {tokens_used} tokens");
        self.inner.observer.on_recorded(identifier, tokens_used);
    }

    /// Takes a concurrency slot without checking the cap.
    ///
    /// The slot is given back by [`ConcurrencySlot::release`], or when it is dropped, so it
    /// is returned on every exit path of the request.
    pub async fn acquire_slot(&self, identifier: &Identifier) -> ConcurrencySlot<S> {
        if !self.inner.config.enabled {
            return ConcurrencySlot::inert();
        }

        let key = self.scope(identifier);

        let holder = match &self.inner.distributed {
            Some(store) => match store.incr_concurrency(key, self.inner.concurrency_ttl).await {
                Ok(_) => SlotHolder::Distributed,
                Err(error) => {
                    self.degraded("acquire_slot", &error);
                    self.inner.local.adjust_concurrency(key, 1);
                    SlotHolder::Local
                }
            },
            None => {
                self.inner.local.adjust_concurrency(key, 1);
                SlotHolder::Local
            }
        };

        self.slot(identifier, holder)
    }

    /// Gives a concurrency slot back.
    pub async fn release_slot(&self, slot: ConcurrencySlot<S>) {
        slot.release().await;
    }

    /// Current usage of an identifier.
    pub async fn usage_snapshot(&self, identifier: &Identifier) -> UsageSnapshot {
        let key = self.scope(identifier);
        let (observation, _) = self.observe(key, "usage_snapshot").await;

        let config = &self.inner.config;
        let ceilings = &self.inner.ceilings;

        UsageSnapshot {
            requests_minute: Usage::new(
                observation.minute.count,
                config.requests_per_minute,
                ceilings.requests(Window::Minute),
            ),
            requests_hour: Usage::new(
                observation.hour.count,
                config.requests_per_hour,
                ceilings.requests(Window::Hour),
            ),
            tokens_minute: Usage::new(
                observation.minute.tokens,
                config.tokens_per_minute,
                ceilings.tokens(Window::Minute),
            ),
            tokens_hour: Usage::new(
                observation.hour.tokens,
                config.tokens_per_hour,
                ceilings.tokens(Window::Hour),
            ),
            concurrent: Usage::new(
                observation.concurrent,
                config.max_concurrent_requests,
                ceilings.concurrent,
            ),
        }
    }

    /// Clears the counters of one identifier, or all counters including the global bucket.
    pub async fn reset(&self, identifier: Option<&Identifier>) {
        let key = identifier.map(Identifier::as_str);

        self.inner.local.reset(key);

        if let Some(store) = &self.inner.distributed
            && let Err(error) = store.reset(key).await
        {
            self.degraded("reset", &error);
        }

        log::info!("Rate limits reset for {}", key.unwrap_or("all identifiers"));
    }

    /// Removes idle in-memory counters. Returns the number of identifiers removed.
    ///
    /// This also runs on its own during [`check`](Self::check), at most once per configured
    /// cleanup interval.
    pub fn cleanup(&self) -> usize {
        self.inner.local.cleanup()
    }

    /// Releases the backend connections.
    pub async fn close(&self) {
        if let Some(store) = &self.inner.distributed {
            store.close().await;
        }
    }

    fn scope<'a>(&self, identifier: &'a Identifier) -> &'a str {
        if self.inner.config.per_user {
            identifier.as_str()
        } else {
            GLOBAL_KEY
        }
    }

    fn slot(&self, identifier: &Identifier, holder: SlotHolder) -> ConcurrencySlot<S> {
        self.inner.observer.on_slot_acquired(identifier);

        ConcurrencySlot::new(self.clone(), identifier.clone(), self.scope(identifier).to_string(), holder)
    }

    async fn decide(&self, identifier: &Identifier, estimated_tokens: u64) -> Result<(), RateLimitError> {
        self.inner.local.maybe_cleanup(self.inner.config.cleanup_interval);

        let (observation, degraded) = self.observe(self.scope(identifier), "check").await;

        if degraded && self.inner.config.on_backend_failure == BackendFailurePolicy::Closed {
            return Err(RateLimitError::BackendUnavailable {
                retry_after: SHORT_RETRY,
            });
        }

        self.evaluate(&observation, estimated_tokens)
    }

    fn evaluate(&self, observation: &Observation, estimated_tokens: u64) -> Result<(), RateLimitError> {
        let ceilings = &self.inner.ceilings;

        if observation.concurrent >= ceilings.concurrent {
            return Err(RateLimitError::ConcurrencyExceeded {
                current: observation.concurrent,
                limit: ceilings.concurrent,
                retry_after: SHORT_RETRY,
            });
        }

        for window in Window::ALL {
            let reading = observation.window(window);
            let limit = ceilings.requests(window);

            if reading.count >= limit {
                return Err(RateLimitError::RequestRateExceeded {
                    window,
                    current: reading.count,
                    limit,
                    retry_after: reading.retry_after,
                });
            }
        }

        if estimated_tokens == 0 {
            return Ok(());
        }

        for window in Window::ALL {
            let reading = observation.window(window);
            let limit = ceilings.tokens(window);

            if reading.tokens.saturating_add(estimated_tokens) > limit {
                return Err(RateLimitError::TokenRateExceeded {
                    window,
                    current: reading.tokens,
                    requested: estimated_tokens,
                    limit,
                    retry_after: reading.retry_after,
                });
            }
        }

        Ok(())
    }

    /// Takes a slot only if the cap is not reached.
    async fn acquire_bounded(&self, identifier: &Identifier) -> Result<ConcurrencySlot<S>, RateLimitError> {
        let key = self.scope(identifier);
        let max = self.inner.ceilings.concurrent;

        if let Some(store) = &self.inner.distributed {
            match store.incr_concurrency(key, self.inner.concurrency_ttl).await {
                Ok(count) if count <= max => return Ok(self.slot(identifier, SlotHolder::Distributed)),
                Ok(count) => {
                    // Another instance took the last slot first, give ours back.
                    if let Err(error) = store.decr_concurrency(key).await {
                        self.degraded("release_slot", &error);
                    }

                    return Err(RateLimitError::ConcurrencyExceeded {
                        current: count.saturating_sub(1),
                        limit: max,
                        retry_after: SHORT_RETRY,
                    });
                }
                Err(error) => {
                    self.degraded("acquire_slot", &error);

                    if self.inner.config.on_backend_failure == BackendFailurePolicy::Closed {
                        return Err(RateLimitError::BackendUnavailable {
                            retry_after: SHORT_RETRY,
                        });
                    }
                }
            }
        }

        match self.inner.local.try_acquire(key, max) {
            Ok(_) => Ok(self.slot(identifier, SlotHolder::Local)),
            Err(current) => Err(RateLimitError::ConcurrencyExceeded {
                current,
                limit: max,
                retry_after: SHORT_RETRY,
            }),
        }
    }

    /// Reads the counters of a key from the distributed store, or from local state when there
    /// is no distributed store or it failed. The flag tells whether the store failed.
    async fn observe(&self, key: &str, operation: &'static str) -> (Observation, bool) {
        let Some(store) = &self.inner.distributed else {
            return (self.observe_local(key), false);
        };

        match observe_distributed(store, key).await {
            Ok(observation) => (observation, false),
            Err(error) => {
                self.degraded(operation, &error);
                (self.observe_local(key), true)
            }
        }
    }

    fn observe_local(&self, key: &str) -> Observation {
        let now = Instant::now();
        let observed = self.inner.local.observe(key);

        Observation {
            concurrent: observed.concurrent,
            minute: Reading::local(&observed.minute, Window::Minute, now),
            hour: Reading::local(&observed.hour, Window::Hour, now),
        }
    }

    pub(crate) fn degraded(&self, operation: &'static str, error: &StorageError) {
        log::warn!("Distributed rate limit backend failed during {operation}, using local counters: {error}");
        self.inner.observer.on_backend_degraded(operation, error);
    }

    fn report(&self, identifier: &Identifier, outcome: Result<(), &RateLimitError>) {
        match outcome {
            Ok(()) => self.inner.observer.on_allowed(identifier),
            Err(error) => {
                log::debug!("Request of '{identifier}' rejected: {error}");
                self.inner.observer.on_rejected(identifier, error);
            }
        }
    }
}

fn validate(config: &RateLimitConfig) -> Result<(), RateLimitError> {
    config
        .validate()
        .map_err(|error| RateLimitError::InvalidConfig(error.to_string()))
}

fn epoch_now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Key of a window counter in the distributed store. Windows are aligned to the epoch, so
/// every instance agrees on the current bucket.
fn window_key(kind: CounterKind, window: Window, epoch: Duration) -> String {
    let bucket = epoch.as_secs() / window.period().as_secs();

    let family = match (kind, window) {
        (CounterKind::Requests, Window::Minute) => WINDOW_FAMILIES[0],
        (CounterKind::Requests, Window::Hour) => WINDOW_FAMILIES[1],
        (CounterKind::Tokens, Window::Minute) => WINDOW_FAMILIES[2],
        (CounterKind::Tokens, Window::Hour) => WINDOW_FAMILIES[3],
    };

    format!("{family}:{bucket}")
}

/// Time until the epoch-aligned window ends.
fn aligned_retry_after(window: Window, epoch: Duration) -> Duration {
    let period = window.period().as_millis() as u64;
    let elapsed = epoch.as_millis() as u64 % period;

    Duration::from_millis(period - elapsed)
}

async fn observe_distributed<S: DistributedStore>(store: &S, key: &str) -> Result<Observation, StorageError> {
    let epoch = epoch_now();

    let keys = [
        CONCURRENCY_KEY.to_string(),
        window_key(CounterKind::Requests, Window::Minute, epoch),
        window_key(CounterKind::Requests, Window::Hour, epoch),
        window_key(CounterKind::Tokens, Window::Minute, epoch),
        window_key(CounterKind::Tokens, Window::Hour, epoch),
    ];

    let counts = store.get_counts(key, &keys).await?;

    let [concurrent, requests_minute, requests_hour, tokens_minute, tokens_hour] = counts[..] else {
        return Err(StorageError::Query(format!(
            "expected {} counters, got {}",
            keys.len(),
            counts.len()
        )));
    };

    Ok(Observation {
        concurrent,
        minute: Reading {
            count: requests_minute,
            tokens: tokens_minute,
            retry_after: aligned_retry_after(Window::Minute, epoch),
        },
        hour: Reading {
            count: requests_hour,
            tokens: tokens_hour,
            retry_after: aligned_retry_after(Window::Hour, epoch),
        },
    })
}

async fn record_distributed<S: DistributedStore>(store: &S, key: &str, tokens: u64) -> Result<(), StorageError> {
    store.increment_many(key, &record_increments(epoch_now(), tokens)).await?;
    Ok(())
}

/// Counter updates of one recorded request. Token counters are left alone for zero tokens.
fn record_increments(epoch: Duration, tokens: u64) -> Vec<Increment> {
    let mut increments = Vec::with_capacity(4);

    for window in Window::ALL {
        // Keep each bucket for two periods so a late reader still finds it.
        let ttl = window.period() * 2;

        increments.push(Increment {
            window_key: window_key(CounterKind::Requests, window, epoch),
            ttl,
            amount: 1,
        });

        if tokens > 0 {
            increments.push(Increment {
                window_key: window_key(CounterKind::Tokens, window, epoch),
                ttl,
                amount: tokens,
            });
        }
    }

    increments
}
