//! In-memory window counters, used on their own or when the distributed backend is down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::window::{Window, WindowState};

/// Everything tracked for one identifier.
#[derive(Debug, Default)]
struct Entry {
    minute: Option<WindowState>,
    hour: Option<WindowState>,
    concurrent: u64,
}

impl Entry {
    fn window_mut(&mut self, window: Window) -> &mut Option<WindowState> {
        match window {
            Window::Minute => &mut self.minute,
            Window::Hour => &mut self.hour,
        }
    }

    /// Current state of a window, starting a new period if the old one elapsed.
    fn rolled(&mut self, window: Window, now: Instant) -> WindowState {
        let state = self.window_mut(window).get_or_insert_with(|| WindowState::new(now));

        if state.roll(window, now) {
            log::debug!("Window {window} elapsed, counters reset");
        }

        *state
    }

    /// Drops windows that have been idle for twice their period. Returns true if nothing is left.
    fn prune(&mut self, now: Instant) -> bool {
        for window in Window::ALL {
            let slot = self.window_mut(window);

            if slot.is_some_and(|state| now.saturating_duration_since(state.window_start) >= window.period() * 2) {
                *slot = None;
            }
        }

        self.minute.is_none() && self.hour.is_none() && self.concurrent == 0
    }
}

/// Counters of one identifier, read under a single lock.
#[derive(Debug, Clone, Copy)]
pub struct LocalObservation {
    /// Minute window after rollover.
    pub minute: WindowState,
    /// Hour window after rollover.
    pub hour: WindowState,
    /// Requests in flight.
    pub concurrent: u64,
}

/// In-memory rate limit storage implementation.
///
/// Every operation on an identifier holds the lock of the map shard the identifier lives
/// in, so a read-compare-write sequence can not interleave with another caller using the
/// same identifier.
pub struct InMemoryStorage {
    entries: DashMap<String, Entry>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last sweep.
    last_sweep: AtomicU64,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            created_at: Instant::now(),
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Reads a window, resetting it first if its period has elapsed.
    pub fn get_and_maybe_roll(&self, identifier: &str, window: Window) -> WindowState {
        let now = Instant::now();

        match self.entries.get_mut(identifier) {
            Some(mut entry) => entry.rolled(window, now),
            None => WindowState::new(now),
        }
    }

    /// Reads both windows and the concurrency counter in one step.
    pub fn observe(&self, identifier: &str) -> LocalObservation {
        let now = Instant::now();

        match self.entries.get_mut(identifier) {
            Some(mut entry) => LocalObservation {
                minute: entry.rolled(Window::Minute, now),
                hour: entry.rolled(Window::Hour, now),
                concurrent: entry.concurrent,
            },
            None => LocalObservation {
                minute: WindowState::new(now),
                hour: WindowState::new(now),
                concurrent: 0,
            },
        }
    }

    /// Adds requests and tokens to both windows.
    pub fn increment(&self, identifier: &str, requests: u64, tokens: u64) {
        let now = Instant::now();
        let mut entry = self.entries.entry(identifier.to_string()).or_default();

        for window in Window::ALL {
            entry.rolled(window, now);

            if let Some(state) = entry.window_mut(window) {
                state.count = state.count.saturating_add(requests);
                state.tokens = state.tokens.saturating_add(tokens);
            }
        }
    }

    /// Requests currently in flight.
    pub fn get_concurrency(&self, identifier: &str) -> u64 {
        self.entries.get(identifier).map(|entry| entry.concurrent).unwrap_or(0)
    }

    /// Moves the concurrency counter by `delta`, never below zero. Returns the new value.
    pub fn adjust_concurrency(&self, identifier: &str, delta: i64) -> u64 {
        if delta < 0 {
            let Some(mut entry) = self.entries.get_mut(identifier) else {
                return 0;
            };

            entry.concurrent = entry.concurrent.saturating_sub(delta.unsigned_abs());
            return entry.concurrent;
        }

        let mut entry = self.entries.entry(identifier.to_string()).or_default();
        entry.concurrent = entry.concurrent.saturating_add(delta.unsigned_abs());
        entry.concurrent
    }

    /// Takes a concurrency slot if fewer than `max` are in use.
    ///
    /// Returns the new count on success and the current count when the cap is reached.
    pub fn try_acquire(&self, identifier: &str, max: u64) -> Result<u64, u64> {
        let mut entry = self.entries.entry(identifier.to_string()).or_default();

        if entry.concurrent >= max {
            return Err(entry.concurrent);
        }

        entry.concurrent += 1;
        Ok(entry.concurrent)
    }

    /// Forgets one identifier, or everything.
    pub fn reset(&self, identifier: Option<&str>) {
        match identifier {
            Some(identifier) => {
                self.entries.remove(identifier);
            }
            None => self.entries.clear(),
        }
    }

    /// Removes stale windows and identifiers with nothing left to track. Returns the number of
    /// identifiers removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();

        self.entries.retain(|_, entry| !entry.prune(now));
        self.mark_swept(now);

        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            log::debug!("Removed {removed} idle rate limit entries");
        }

        removed
    }

    /// Runs [`Self::cleanup`] if the last sweep is older than `interval`.
    pub fn maybe_cleanup(&self, interval: Duration) -> Option<usize> {
        let now_ms = self.millis_since_creation(Instant::now());
        let last = self.last_sweep.load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) < interval.as_millis() as u64 {
            return None;
        }

        // Only one caller wins the sweep for this interval.
        self.last_sweep
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;

        Some(self.cleanup())
    }

    /// Number of identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mark_swept(&self, now: Instant) {
        self.last_sweep
            .fetch_max(self.millis_since_creation(now), Ordering::AcqRel);
    }

    fn millis_since_creation(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.created_at).as_millis() as u64
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn increment_updates_both_windows() {
        let storage = InMemoryStorage::new();

        storage.increment("u1", 1, 250);
        storage.increment("u1", 1, 50);

        let observed = storage.observe("u1");
        assert_eq!(observed.minute.count, 2);
        assert_eq!(observed.minute.tokens, 300);
        assert_eq!(observed.hour.count, 2);
        assert_eq!(observed.hour.tokens, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_rolls_over_while_hour_keeps_counting() {
        let storage = InMemoryStorage::new();
        storage.increment("u1", 1, 10);

        tokio::time::advance(Duration::from_secs(61)).await;

        let minute = storage.get_and_maybe_roll("u1", Window::Minute);
        let hour = storage.get_and_maybe_roll("u1", Window::Hour);

        assert_eq!(minute.count, 0);
        assert_eq!(minute.tokens, 0);
        assert_eq!(hour.count, 1);
        assert_eq!(hour.tokens, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_unknown_identifier_does_not_track_it() {
        let storage = InMemoryStorage::new();

        let observed = storage.observe("nobody");

        assert_eq!(observed.minute.count, 0);
        assert_eq!(observed.concurrent, 0);
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_goes_negative() {
        let storage = InMemoryStorage::new();

        assert_eq!(storage.adjust_concurrency("u1", -1), 0);
        assert_eq!(storage.adjust_concurrency("u1", 1), 1);
        assert_eq!(storage.adjust_concurrency("u1", -3), 0);
        assert_eq!(storage.get_concurrency("u1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_respects_cap() {
        let storage = InMemoryStorage::new();

        assert_eq!(storage.try_acquire("u1", 2), Ok(1));
        assert_eq!(storage.try_acquire("u1", 2), Ok(2));
        assert_eq!(storage.try_acquire("u1", 2), Err(2));
        assert_eq!(storage.try_acquire("u2", 2), Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_never_exceed_cap() {
        let storage = Arc::new(InMemoryStorage::new());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.try_acquire("shared", 10).is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(storage.get_concurrency("shared"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_one_or_all() {
        let storage = InMemoryStorage::new();
        storage.increment("u1", 1, 0);
        storage.increment("u2", 1, 0);

        storage.reset(Some("u1"));
        assert_eq!(storage.observe("u1").minute.count, 0);
        assert_eq!(storage.observe("u2").minute.count, 1);

        storage.reset(None);
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_idle_entries_only() {
        let storage = InMemoryStorage::new();
        storage.increment("idle", 1, 0);
        storage.increment("busy", 1, 0);
        storage.adjust_concurrency("busy", 1);

        tokio::time::advance(Duration::from_secs(2 * 3600)).await;
        storage.increment("fresh", 1, 0);

        assert_eq!(storage.cleanup(), 1);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get_concurrency("busy"), 1);
        assert_eq!(storage.observe("fresh").minute.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_keeps_hour_window_after_minute_expires() {
        let storage = InMemoryStorage::new();
        storage.increment("u1", 1, 0);

        tokio::time::advance(Duration::from_secs(180)).await;

        assert_eq!(storage.cleanup(), 0);
        assert_eq!(storage.observe("u1").hour.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn maybe_cleanup_honors_interval() {
        let storage = InMemoryStorage::new();
        let interval = Duration::from_secs(60);

        assert_eq!(storage.maybe_cleanup(interval), None);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(storage.maybe_cleanup(interval), Some(0));
        assert_eq!(storage.maybe_cleanup(interval), None);
    }
}
