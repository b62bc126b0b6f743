//! Derivation of the key callers are limited by.

use std::fmt;

use config::RateLimitConfig;

use crate::error::RateLimitError;

/// Bucket shared by every caller without a user or session id.
pub const ANONYMOUS: &str = "anonymous";

const SESSION_PREFIX: &str = "session:";

/// Key that counters are partitioned by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    /// Wraps an already derived key, such as `tool:search`.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the shared anonymous bucket.
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Turns the caller identity into an [`Identifier`].
#[derive(Debug, Clone, Copy)]
pub struct IdentifierResolver {
    require_user_id: bool,
    fallback_to_session: bool,
}

impl IdentifierResolver {
    /// Creates a resolver following the identity settings of the configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            require_user_id: config.require_user_id,
            fallback_to_session: config.fallback_to_session,
        }
    }

    /// Resolves the identifier for a request.
    ///
    /// A user id wins. Without one, the request is rejected when user ids are required,
    /// partitioned by session when session fallback is enabled, and otherwise counted in
    /// the shared anonymous bucket. Empty ids count as missing.
    pub fn resolve(&self, user_id: Option<&str>, session_id: Option<&str>) -> Result<Identifier, RateLimitError> {
        if let Some(user_id) = user_id.filter(|id| !id.is_empty()) {
            return Ok(Identifier::new(user_id));
        }

        if self.require_user_id {
            log::debug!("Rejecting request without user id, identification is required");
            return Err(RateLimitError::IdentityRequired);
        }

        if self.fallback_to_session
            && let Some(session_id) = session_id.filter(|id| !id.is_empty())
        {
            return Ok(Identifier::new(format!("{SESSION_PREFIX}{session_id}")));
        }

        Ok(Identifier::new(ANONYMOUS))
    }
}
