//! Error types for zero-sqlclient.

use thiserror::Error;

/// Result type for zero-sqlclient operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A well-formed error response from the server, normalized across protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Severity as reported by the server (PostgreSQL: ERROR, FATAL, PANIC, ...)
    pub severity: Option<String>,
    /// SQLSTATE code (5 characters)
    pub code: Option<String>,
    /// Vendor error number (MySQL error code, DB2 SQLCODE)
    pub vendor_code: Option<i32>,
    /// Primary error message
    pub message: String,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(vendor_code) = self.vendor_code {
            write!(f, " [{}]", vendor_code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for zero-sqlclient.
#[derive(Debug, Error)]
pub enum Error {
    /// Error response tied to one command. The session stays usable.
    #[error("Server error: {0}")]
    Server(ServerError),

    /// Malformed or unexpected bytes from the server.
    ///
    /// A fatal protocol error desynchronizes the session and breaks it; a
    /// non-fatal one fails only the command being decoded.
    #[error("Protocol error: {message}")]
    Protocol { message: String, fatal: bool },

    /// The transport closed or failed before the command was answered.
    #[error("Connection lost")]
    ConnectionLost,

    /// The pool wait queue is full.
    #[error("Pool exhausted: {waiters} acquirers already waiting")]
    PoolExhausted { waiters: usize },

    /// A parameter or frame exceeds the configured or protocol limit. Nothing was sent.
    #[error("Payload too large: {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The caller cancelled the command before it was sent.
    #[error("Command cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Value could not be decoded into the requested type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid usage (e.g., submitting to a closed session)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Non-fatal protocol error: only the current command fails.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            fatal: false,
        }
    }

    /// Fatal protocol error: the session can no longer be trusted.
    pub fn fatal_protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            fatal: true,
        }
    }

    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionLost => true,
            Error::Protocol { fatal, .. } => *fatal,
            _ => false,
        }
    }

    /// Returns true for protocol errors that break the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol { fatal: true, .. })
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    /// Produce an equivalent error for fanning one failure out to several commands.
    ///
    /// I/O errors are not cloneable; they are reported as `ConnectionLost`.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Server(fields) => Error::Server(fields.clone()),
            Error::Protocol { message, fatal } => Error::Protocol {
                message: message.clone(),
                fatal: *fatal,
            },
            Error::ConnectionLost | Error::Io(_) => Error::ConnectionLost,
            Error::PoolExhausted { waiters } => Error::PoolExhausted { waiters: *waiters },
            Error::PayloadTooLarge { size, limit } => Error::PayloadTooLarge {
                size: *size,
                limit: *limit,
            },
            Error::Cancelled => Error::Cancelled,
            Error::Auth(s) => Error::Auth(s.clone()),
            Error::Decode(s) => Error::Decode(s.clone()),
            Error::InvalidUsage(s) => Error::InvalidUsage(s.clone()),
            Error::Unsupported(s) => Error::Unsupported(s.clone()),
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::fatal_protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError {
            severity: Some("ERROR".into()),
            code: Some("42P01".into()),
            message: "relation \"missing\" does not exist".into(),
            ..Default::default()
        };
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"missing\" does not exist (SQLSTATE 42P01)"
        );
    }

    #[test]
    fn test_broken_classification() {
        assert!(Error::ConnectionLost.is_connection_broken());
        assert!(Error::fatal_protocol("bad frame").is_connection_broken());
        assert!(!Error::protocol("unexpected row").is_connection_broken());
        assert!(!Error::Server(ServerError::default()).is_connection_broken());
        assert!(!Error::Cancelled.is_connection_broken());
    }

    #[test]
    fn test_duplicate_keeps_server_fields() {
        let err = Error::Server(ServerError {
            code: Some("42601".into()),
            message: "syntax error".into(),
            ..Default::default()
        });
        assert_eq!(err.duplicate().sqlstate(), Some("42601"));
        let io = Error::Io(std::io::Error::other("reset"));
        assert!(matches!(io.duplicate(), Error::ConnectionLost));
    }
}
