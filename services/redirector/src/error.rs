//! Error types for the redirector.

use std::io;

use thiserror::Error;

/// Failure to open the backend side of a session.
#[derive(Debug, Error)]
pub enum DialError {
    /// Backend did not complete the handshake within the dial timeout.
    #[error("connection_timeout: no answer from {target} within {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    /// Backend actively refused the connection.
    #[error("connection_refused: {target}: {source}")]
    Refused {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Any other OS-level error (unreachable network, resolution failure, ...).
    #[error("connection_error: {target}: {source}")]
    Other {
        target: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// Classify a connect failure.
    pub fn from_io(target: impl Into<String>, source: io::Error) -> Self {
        let target = target.into();
        match source.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused { target, source },
            io::ErrorKind::TimedOut => DialError::Timeout {
                target,
                timeout_ms: 0,
            },
            _ => DialError::Other { target, source },
        }
    }

    /// Reason code sent as `error_type` in telemetry.
    pub fn error_type(&self) -> &'static str {
        match self {
            DialError::Timeout { .. } => "connection_timeout",
            DialError::Refused { .. } => "connection_refused",
            DialError::Other { .. } => "connection_error",
        }
    }
}
