//! Hooks for observing admission decisions.

use telemetry::metrics::{
    RATE_LIMIT_BACKEND_DEGRADED, RATE_LIMIT_DECISIONS, RATE_LIMIT_RECORDED_TOKENS, RATE_LIMIT_SLOTS_IN_USE, meter,
};
use telemetry::{Counter, KeyValue, UpDownCounter};

use crate::error::RateLimitError;
use crate::identifier::Identifier;
use crate::storage::StorageError;

/// Receives every decision and backend failure of a rate limiter.
///
/// The limiter calls these hooks unconditionally and ignores what happens inside them, so an
/// implementation must not panic and must deal with its own failures.
pub trait RateLimitObserver: Send + Sync {
    /// A request passed every limit.
    fn on_allowed(&self, _identifier: &Identifier) {}

    /// A request was rejected.
    fn on_rejected(&self, _identifier: &Identifier, _error: &RateLimitError) {}

    /// Usage was recorded.
    fn on_recorded(&self, _identifier: &Identifier, _tokens: u64) {}

    /// A concurrency slot was taken.
    fn on_slot_acquired(&self, _identifier: &Identifier) {}

    /// A concurrency slot was given back.
    fn on_slot_released(&self, _identifier: &Identifier) {}

    /// The distributed backend failed and the call was answered locally.
    fn on_backend_degraded(&self, _operation: &'static str, _error: &StorageError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RateLimitObserver for NoopObserver {}

/// Observer exporting OpenTelemetry counters through the global meter.
///
/// Identifiers are never used as attributes to keep metric cardinality bounded.
pub struct MetricsObserver {
    decisions: Counter<u64>,
    degraded: Counter<u64>,
    tokens: Counter<u64>,
    slots: UpDownCounter<i64>,
}

impl MetricsObserver {
    /// Creates the instruments on the global meter.
    pub fn new() -> Self {
        let meter = meter();

        Self {
            decisions: meter.u64_counter(RATE_LIMIT_DECISIONS).build(),
            degraded: meter.u64_counter(RATE_LIMIT_BACKEND_DEGRADED).build(),
            tokens: meter.u64_counter(RATE_LIMIT_RECORDED_TOKENS).build(),
            slots: meter.i64_up_down_counter(RATE_LIMIT_SLOTS_IN_USE).build(),
        }
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitObserver for MetricsObserver {
    fn on_allowed(&self, _identifier: &Identifier) {
        self.decisions.add(1, &[KeyValue::new("outcome", "allowed")]);
    }

    fn on_rejected(&self, _identifier: &Identifier, error: &RateLimitError) {
        self.decisions.add(1, &[KeyValue::new("outcome", error.kind())]);
    }

    fn on_recorded(&self, _identifier: &Identifier, tokens: u64) {
        if tokens > 0 {
            self.tokens.add(tokens, &[]);
        }
    }

    fn on_slot_acquired(&self, _identifier: &Identifier) {
        self.slots.add(1, &[]);
    }

    fn on_slot_released(&self, _identifier: &Identifier) {
        self.slots.add(-1, &[]);
    }

    fn on_backend_degraded(&self, operation: &'static str, _error: &StorageError) {
        self.degraded.add(1, &[KeyValue::new("operation", operation)]);
    }
}
