//! Read-only usage view for diagnostics.

use serde::Serialize;

/// Usage of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Amount used in the current period.
    pub used: u64,
    /// Configured limit, without burst allowance.
    pub limit: u64,
    /// Amount left before requests are rejected, burst allowance included.
    pub remaining: u64,
}

impl Usage {
    pub(crate) fn new(used: u64, limit: u64, ceiling: u64) -> Self {
        Self {
            used,
            limit,
            remaining: ceiling.saturating_sub(used),
        }
    }
}

/// Usage of every limited dimension of one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    /// Requests in the current minute.
    pub requests_minute: Usage,
    /// Requests in the current hour.
    pub requests_hour: Usage,
    /// Tokens in the current minute.
    pub tokens_minute: Usage,
    /// Tokens in the current hour.
    pub tokens_hour: Usage,
    /// Requests in flight.
    pub concurrent: Usage,
}
