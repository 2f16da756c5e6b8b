//! Categorised error type shared by every skiff service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured service error: a failure category plus a human-readable
/// message. Callers match on `kind`, never on message substrings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkiffError {
    pub kind: ErrorKind,
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// No usable credential supplied, or the server rejected authentication.
    AuthFailed,
    /// TCP-level dial failure (refusal, DNS, timeout) before the handshake.
    ConnectionFailed,
    /// SSH negotiation failed after the socket came up.
    HandshakeFailed,
    /// Pty allocation or remote shell start failed.
    SessionFailed,
    /// The session exists but has no live shell behind it.
    NoActiveSession,
    /// No session registered under the given id.
    SessionNotFound,
    /// A remote file-access operation failed.
    SftpFailed,
    /// Local I/O failure.
    IoError,
    /// Transfer cancelled by the user. Distinct from `IoError`.
    Cancelled,
    /// No transfer task registered under the given id.
    TransferNotFound,
    /// A bounded wait elapsed.
    Timeout,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Catch-all.
    Unknown,
}

pub type SkiffResult<T> = Result<T, SkiffError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SkiffError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, msg)
    }

    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandshakeFailed, msg)
    }

    pub fn session_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionFailed, msg)
    }

    pub fn no_active_session(id: &str) -> Self {
        Self::new(
            ErrorKind::NoActiveSession,
            format!("session '{}' has no active shell", id),
        )
        .with_session(id)
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("session '{}' not found", id),
        )
        .with_session(id)
    }

    pub fn sftp_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SftpFailed, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, msg)
    }

    /// The one cancellation error every cancelled transfer reports.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "transfer cancelled by user")
    }

    pub fn transfer_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::TransferNotFound,
            format!("transfer '{}' not found", id),
        )
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, msg)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(id) => write!(f, "[{:?} session {}] {}", self.kind, id, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SkiffError {}

impl From<std::io::Error> for SkiffError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<SkiffError> for String {
    fn from(e: SkiffError) -> String {
        e.message
    }
}
