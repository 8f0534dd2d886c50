//! Error types for pgmode.

use thiserror::Error;

use crate::registry::Phase;

/// Result type for pgmode operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized form.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
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

/// Error type for pgmode.
#[derive(Debug, Error)]
pub enum Error {
    /// No connection target could be resolved, or the target is malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client reported a connect failure
    #[error("Connection failed: {0}")]
    Connect(String),

    /// No connection exists for the identity
    #[error("Not connected")]
    NotConnected,

    /// Operation requested in a phase that disallows it
    #[error("Invalid state: connection is {0}")]
    InvalidState(Phase),

    /// Link health check failed before sending a query
    #[error("Connection lost")]
    ConnectionLost,

    /// The client rejected the query synchronously
    #[error("Could not send query: {0}")]
    Send(String),

    /// I/O error (readiness or input consumption) mid-operation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request was abandoned by a disconnect or a failed operation
    #[error("Request cancelled")]
    Cancelled,

    /// Server error response
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns true if the error leaves the connection unusable.
    ///
    /// The registry tears a connection down when an operation fails with
    /// such an error; `Send` keeps the connection `Ready`.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Config(_)
            | Error::NotConnected
            | Error::InvalidState(_)
            | Error::Send(_)
            | Error::Cancelled => false,
            Error::Server(fields) => !matches!(fields.severity(), Some("ERROR")),
            Error::Connect(_)
            | Error::ConnectionLost
            | Error::Io(_)
            | Error::Protocol(_)
            | Error::Auth(_)
            | Error::Unsupported(_) => true,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    /// Copy of this error for delivery to more than one callback.
    ///
    /// `io::Error` is not `Clone`, so I/O errors keep their kind and message.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::Config(s) => Error::Config(s.clone()),
            Error::Connect(s) => Error::Connect(s.clone()),
            Error::NotConnected => Error::NotConnected,
            Error::InvalidState(phase) => Error::InvalidState(*phase),
            Error::ConnectionLost => Error::ConnectionLost,
            Error::Send(s) => Error::Send(s.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Cancelled => Error::Cancelled,
            Error::Server(fields) => Error::Server(fields.clone()),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::Auth(s) => Error::Auth(s.clone()),
            Error::Unsupported(s) => Error::Unsupported(s.clone()),
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_keeps_connection() {
        assert!(!Error::Send("busy".into()).is_connection_broken());
        assert!(Error::ConnectionLost.is_connection_broken());
        assert!(Error::Io(std::io::Error::other("reset")).is_connection_broken());
    }

    #[test]
    fn server_error_severity() {
        let error = Error::Server(ErrorFields {
            severity: Some("ERROR".into()),
            ..Default::default()
        });
        assert!(!error.is_connection_broken());

        let fatal = Error::Server(ErrorFields {
            severity: Some("FATAL".into()),
            code: Some("57P01".into()),
            ..Default::default()
        });
        assert!(fatal.is_connection_broken());
        assert_eq!(fatal.sqlstate(), Some("57P01"));
    }

    #[test]
    fn display_fields() {
        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            message: Some("relation \"nope\" does not exist".into()),
            code: Some("42P01".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.to_string(),
            "ERROR: relation \"nope\" does not exist (SQLSTATE 42P01)"
        );
    }
}
