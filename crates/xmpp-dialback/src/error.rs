//! Dialback-specific error types.

use thiserror::Error;

/// Errors that can occur during a dialback exchange.
///
/// None of these is fatal to the process: at most one stream or session is
/// failed by any of them.
#[derive(Debug, Error)]
pub enum DialbackError {
    // ── Outcomes reported to the caller ─────────────────────────────────────

    #[error("Dialback rejected by the receiving server")]
    DialbackFailed,

    #[error("Authoritative server did not answer the verify request in time")]
    VerificationTimeout,

    // ── Stream failures ─────────────────────────────────────────────────────

    #[error("Stream error during dialback: {0}")]
    StreamError(String),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Stream has no stream ID to bind a dialback key to")]
    MissingStreamId,

    // ── Protocol ────────────────────────────────────────────────────────────

    #[error("Dialback protocol violation: {0}")]
    ProtocolViolation(String),

    // ── Configuration ───────────────────────────────────────────────────────

    #[error("No dialback secret configured for '{0}'")]
    NoSecret(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // ── General ─────────────────────────────────────────────────────────────

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DialbackError {
    /// Whether the caller may reasonably fall back to another trust
    /// mechanism (or simply retry) instead of tearing the stream down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DialbackFailed | Self::VerificationTimeout)
    }
}

/// Convenience type alias for Results using DialbackError.
pub type DialbackResult<T> = Result<T, DialbackError>;
