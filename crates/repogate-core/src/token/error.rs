//! Token-specific error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from minting or verifying lease tokens.
///
/// Messages never include secret or tag bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token string could not be decoded, or its MAC did not verify
    /// under the supplied secret.
    #[error("invalid lease token")]
    Invalid,

    /// The token's MAC verified but its expiration has passed.
    #[error("lease token expired at {expired_at}")]
    Expired {
        /// When the token expired.
        expired_at: DateTime<Utc>,
    },

    /// The requested token lifetime is not usable.
    #[error("invalid token lifetime: {seconds}s")]
    InvalidLifetime {
        /// The rejected lifetime, in whole seconds.
        seconds: i64,
    },
}
