//! Error types for rate limiting.

use std::time::Duration;

use crate::storage::StorageError;
use crate::window::Window;

/// Errors that can occur during rate limiting.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The caller has no user id and one is required.
    #[error("User identification required for rate limiting")]
    IdentityRequired,

    /// Too many requests of this caller are in flight.
    #[error("Too many concurrent requests: {current}/{limit}")]
    ConcurrencyExceeded {
        /// Requests in flight.
        current: u64,
        /// Maximum number of requests in flight.
        limit: u64,
        /// Time to wait before retrying.
        retry_after: Duration,
    },

    /// The request count of a window reached its ceiling.
    #[error("Rate limit exceeded: {current}/{limit} requests per {window}")]
    RequestRateExceeded {
        /// Window that is exhausted.
        window: Window,
        /// Requests recorded in the window.
        current: u64,
        /// Ceiling of the window, burst allowance included.
        limit: u64,
        /// Time until the window resets.
        retry_after: Duration,
    },

    /// The estimated tokens do not fit in a window's token budget.
    #[error("Token limit exceeded: {current} used + {requested} requested > {limit} tokens per {window}")]
    TokenRateExceeded {
        /// Window that is exhausted.
        window: Window,
        /// Tokens recorded in the window.
        current: u64,
        /// Tokens the request expects to use.
        requested: u64,
        /// Ceiling of the window, burst allowance included.
        limit: u64,
        /// Time until the window resets.
        retry_after: Duration,
    },

    /// The distributed backend is down and the limiter is configured to fail closed.
    #[error("Rate limit backend unavailable")]
    BackendUnavailable {
        /// Time to wait before retrying.
        retry_after: Duration,
    },

    /// The configuration can not be used.
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// Storage backend could not be set up.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RateLimitError {
    /// Get the retry-after duration if waiting can help.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConcurrencyExceeded { retry_after, .. }
            | Self::RequestRateExceeded { retry_after, .. }
            | Self::TokenRateExceeded { retry_after, .. }
            | Self::BackendUnavailable { retry_after } => Some(*retry_after),
            Self::IdentityRequired | Self::InvalidConfig(_) | Self::Storage(_) => None,
        }
    }

    /// Whether this is a limit decision, as opposed to an identity or setup problem.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyExceeded { .. } | Self::RequestRateExceeded { .. } | Self::TokenRateExceeded { .. }
        )
    }

    /// Stable name of the rejection, used in logs and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentityRequired => "identity_required",
            Self::ConcurrencyExceeded { .. } => "concurrent",
            Self::RequestRateExceeded {
                window: Window::Minute, ..
            } => "requests_per_minute",
            Self::RequestRateExceeded { window: Window::Hour, .. } => "requests_per_hour",
            Self::TokenRateExceeded {
                window: Window::Minute, ..
            } => "tokens_per_minute",
            Self::TokenRateExceeded { window: Window::Hour, .. } => "tokens_per_hour",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let error = RateLimitError::RequestRateExceeded {
            window: Window::Minute,
            current: 90,
            limit: 90,
            retry_after: Duration::from_secs(12),
        };

        insta::assert_snapshot!(error, @"Rate limit exceeded: 90/90 requests per minute");
        assert_eq!(error.kind(), "requests_per_minute");
        assert_eq!(error.retry_after(), Some(Duration::from_secs(12)));

        let error = RateLimitError::TokenRateExceeded {
            window: Window::Hour,
            current: 900,
            requested: 200,
            limit: 1000,
            retry_after: Duration::from_secs(60),
        };

        insta::assert_snapshot!(error, @"Token limit exceeded: 900 used + 200 requested > 1000 tokens per hour");
        assert_eq!(error.kind(), "tokens_per_hour");
    }

    #[test]
    fn identity_errors_are_not_retryable() {
        let error = RateLimitError::IdentityRequired;

        assert_eq!(error.retry_after(), None);
        assert!(!error.is_limit_exceeded());
    }
}
