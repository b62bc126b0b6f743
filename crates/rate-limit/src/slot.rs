//! Concurrency slots tied to the lifetime of a request.

use std::fmt;

use crate::identifier::Identifier;
use crate::limiter::RateLimiter;
use crate::storage::{DistributedStore, RedisStorage};

/// Which counter a slot was taken from. Released on the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotHolder {
    Local,
    Distributed,
}

struct Held<S> {
    limiter: RateLimiter<S>,
    identifier: Identifier,
    key: String,
    holder: SlotHolder,
}

impl<S: DistributedStore + 'static> Held<S> {
    async fn release(self) {
        match self.holder {
            SlotHolder::Local => self.release_local(),
            SlotHolder::Distributed => {
                if let Some(store) = &self.limiter.inner.distributed
                    && let Err(error) = store.decr_concurrency(&self.key).await
                {
                    self.limiter.degraded("release_slot", &error);
                }

                self.limiter.inner.observer.on_slot_released(&self.identifier);
            }
        }
    }

    fn release_local(self) {
        self.limiter.inner.local.adjust_concurrency(&self.key, -1);
        self.limiter.inner.observer.on_slot_released(&self.identifier);
    }
}

/// One in-flight request counted against the concurrency cap.
///
/// Give the slot back with [`release`](Self::release) or [`complete`](Self::complete). A slot
/// that is dropped instead is still released: local slots right away, distributed slots in a
/// background task on the current Tokio runtime. Without a runtime the distributed counter is
/// left to expire.
#[must_use = "dropping the slot releases it immediately"]
pub struct ConcurrencySlot<S: DistributedStore + 'static = RedisStorage> {
    held: Option<Held<S>>,
}

impl<S: DistributedStore + 'static> ConcurrencySlot<S> {
    pub(crate) fn new(limiter: RateLimiter<S>, identifier: Identifier, key: String, holder: SlotHolder) -> Self {
        Self {
            held: Some(Held {
                limiter,
                identifier,
                key,
                holder,
            }),
        }
    }

    /// A slot that counts nothing, handed out while rate limiting is disabled.
    pub(crate) fn inert() -> Self {
        Self { held: None }
    }

    /// The identifier the slot was taken for, `None` if rate limiting is disabled.
    pub fn identifier(&self) -> Option<&Identifier> {
        self.held.as_ref().map(|held| &held.identifier)
    }

    /// Whether the slot is counted in the distributed store.
    pub fn is_distributed(&self) -> bool {
        self.held
            .as_ref()
            .is_some_and(|held| held.holder == SlotHolder::Distributed)
    }

    /// Gives the slot back.
    pub async fn release(mut self) {
        if let Some(held) = self.held.take() {
            held.release().await;
        }
    }

    /// Records the tokens the request used and gives the slot back.
    pub async fn complete(mut self, tokens_used: u64) {
        if let Some(held) = self.held.take() {
            held.limiter.record(&held.identifier, tokens_used).await;
            held.release().await;
        }
    }
}

impl<S: DistributedStore + 'static> Drop for ConcurrencySlot<S> {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        match held.holder {
            SlotHolder::Local => held.release_local(),
            SlotHolder::Distributed => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(held.release());
                }
                Err(_) => {
                    log::warn!(
                        "Concurrency slot of '{}' dropped outside of a Tokio runtime, the counter expires after its TTL",
                        held.identifier
                    );
                }
            },
        }
    }
}

impl<S: DistributedStore + 'static> fmt::Debug for ConcurrencySlot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ConcurrencySlot");

        match &self.held {
            Some(held) => debug
                .field("identifier", &held.identifier)
                .field("holder", &held.holder)
                .finish(),
            None => debug.finish_non_exhaustive(),
        }
    }
}
