use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Refused,
    Timeout,
    Reset,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Refused => "refused",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Reset => "reset",
        };
        f.write_str(label)
    }
}

/// Failure of the byte-level connection to the debugging endpoint.
///
/// The transport never retries on its own; callers decide whether a failure is
/// worth another attempt (pairing) or fatal (an open shell session).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport {kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Refused, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Reset, message)
    }

    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable => TransportErrorKind::Refused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Reset,
        };
        Self::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("invalid pairing credentials: {0}")]
    InvalidCode(String),
    #[error("a pairing attempt is already in progress")]
    AlreadyInProgress,
    #[error("pairing failed: {0}")]
    TransportFailure(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("shell session is closed")]
    Closed,
    #[error("shell session is not ready")]
    NotReady,
    #[error("shell session already started")]
    AlreadyStarted,
    #[error("shell transport failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEPENDENCY", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    pub fn session(err: &SessionError, trace_id: impl Into<String>) -> Self {
        let code = match err {
            SessionError::Closed => "ERR_SESSION_CLOSED",
            SessionError::NotReady => "ERR_NOT_READY",
            SessionError::AlreadyStarted => "ERR_VALIDATION",
            SessionError::Transport(_) => "ERR_DEPENDENCY",
        };
        Self::new(code, err.to_string(), trace_id)
    }

    pub fn pairing(err: &PairingError, trace_id: impl Into<String>) -> Self {
        let code = match err {
            PairingError::InvalidCode(_) | PairingError::AlreadyInProgress => "ERR_VALIDATION",
            PairingError::TransportFailure(_) => "ERR_DEPENDENCY",
        };
        Self::new(code, err.to_string(), trace_id)
    }

    pub fn is_session_closed(&self) -> bool {
        self.code == "ERR_SESSION_CLOSED"
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
