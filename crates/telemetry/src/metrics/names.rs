//! Metric names recorded by the rate limiter.

/// Admission decisions, with an `outcome` attribute (`allowed` or the rejection kind).
pub const RATE_LIMIT_DECISIONS: &str = "gatekeeper.rate_limit.decisions";

/// Distributed backend failures that were answered from local state, with an `operation` attribute.
pub const RATE_LIMIT_BACKEND_DEGRADED: &str = "gatekeeper.rate_limit.backend.degraded";

/// Distributed backend command latency in milliseconds, with an `operation` attribute.
pub const RATE_LIMIT_BACKEND_DURATION: &str = "gatekeeper.rate_limit.backend.duration";

/// Tokens accounted by `record`.
pub const RATE_LIMIT_RECORDED_TOKENS: &str = "gatekeeper.rate_limit.recorded.tokens";

/// Concurrency slots currently held by this instance.
pub const RATE_LIMIT_SLOTS_IN_USE: &str = "gatekeeper.rate_limit.slots.in_use";
