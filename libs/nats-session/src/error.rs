//! Error types for console session operations.
//!
//! Library failures are mapped into these variants at the call site so the
//! console can present a human-readable message without matching on
//! `async-nats` error kinds.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the nats-session crate.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Operation attempted without an open connection.
    #[error("not connected")]
    NotConnected,

    /// Credentials could not be turned into connect options.
    #[error("auth error: {0}")]
    Auth(String),

    /// Header JSON was malformed or had the wrong shape.
    #[error("invalid headers: {0}")]
    InvalidHeader(String),

    /// Subject was empty, contained whitespace, or used wildcards where
    /// they are not allowed.
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: &'static str },

    /// Request did not receive a reply before its deadline.
    #[error("request to '{subject}' timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    /// The server reported that nothing is subscribed to the request subject.
    #[error("no responders for '{0}'")]
    NoResponders(String),

    /// No bucket open, key absent, stream or message missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection or library-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local file access (credentials, state file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    /// Returns true if this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConsoleError::Timeout { .. })
    }

    /// Returns true if the operation needs a connection first.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ConsoleError::NotConnected)
    }

    /// Returns true if this error is a missing bucket, key, stream or message.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConsoleError::NotFound(_))
    }
}

/// Shorthand result alias for session operations.
pub type ConsoleResult<T> = Result<T, ConsoleError>;
