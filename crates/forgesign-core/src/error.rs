//! Error taxonomy for the signing flow.
//!
//! Every failure in the cycle is fatal: there is no retry or backoff
//! anywhere, and idempotency comes only from re-running the whole command,
//! which clobbers the fixed scratch locations of a prior attempt.

use thiserror::Error;

/// Errors raised anywhere in the request/verify cycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignError {
    /// Invalid invocation or environment configuration (malformed
    /// `key=value`, malformed bucket path, missing publish credentials).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable, or a publish/subscribe operation failed. The
    /// listener loop stops on this; it is never retried.
    #[error("transport error: {0}")]
    Transport(String),

    /// No terminal response arrived within the wait bound.
    #[error("timed out after {0}s waiting for the signer to finish")]
    Timeout(u64),

    /// The remote signer reported a non-success status. Carries the
    /// signer's failure message verbatim when one was provided.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A returned signature did not verify against the trusted keys.
    /// Fatal in production; downgraded to a logged warning in staging.
    #[error("signature verification failed: {0}")]
    Verification(String),

    /// Blob transfer or archive assembly failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SignError {
    /// Stable string identifier for the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Signing(_) => "signing",
            Self::Verification(_) => "verification",
            Self::Io(_) => "io",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SignError>;
