use std::error::Error as _;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) const CODE_PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
pub(crate) const CODE_RESOURCE_LEAK: &str = "RESOURCE_LEAK";
pub(crate) const CODE_CANCELLED: &str = "CANCELLED";
pub(crate) const CODE_PANIC: &str = "PANIC";
pub(crate) const CODE_GENERIC: &str = "SQLITE_ERROR";
pub(crate) const CODE_BUSY: &str = "SQLITE_BUSY";

#[derive(Debug, Error)]
pub enum SqlLeaseError {
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("{0}")]
    Engine(WireError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Reservation cancelled")]
    Cancelled,

    #[error("Statement was not finalized before close: {sql}")]
    ResourceLeak { sql: String },

    #[error("Pool has been closed")]
    PoolClosed,

    #[error("Failed to close {} handle(s): {}", .0.len(), .0.join("; "))]
    CloseFailed(Vec<String>),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SqlLeaseError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        SqlLeaseError::ProtocolViolation(message.into())
    }

    /// Wire code for this error, as it would appear in a [`WireError`].
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            SqlLeaseError::SqliteError(err) => sqlite_code(err),
            SqlLeaseError::Engine(wire) => &wire.code,
            SqlLeaseError::ProtocolViolation(_) => CODE_PROTOCOL_VIOLATION,
            SqlLeaseError::ResourceLeak { .. } => CODE_RESOURCE_LEAK,
            SqlLeaseError::Cancelled => CODE_CANCELLED,
            SqlLeaseError::PoolClosed
            | SqlLeaseError::CloseFailed(_)
            | SqlLeaseError::ConnectionError(_)
            | SqlLeaseError::ConfigError(_) => CODE_GENERIC,
        }
    }

    /// True when the engine reported `SQLITE_BUSY`.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.code() == CODE_BUSY
    }

    /// Normalize into the transport-safe shape.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        if let SqlLeaseError::Engine(wire) = self {
            return wire.clone();
        }
        let message = match self {
            SqlLeaseError::ResourceLeak { sql } => sql.clone(),
            SqlLeaseError::ProtocolViolation(message) => message.clone(),
            other => other.to_string(),
        };
        WireError {
            code: self.code().to_string(),
            message,
            stack: render_sources(self),
        }
    }
}

impl From<WireError> for SqlLeaseError {
    fn from(wire: WireError) -> Self {
        match wire.code.as_str() {
            CODE_PROTOCOL_VIOLATION => SqlLeaseError::ProtocolViolation(wire.message),
            CODE_RESOURCE_LEAK => SqlLeaseError::ResourceLeak { sql: wire.message },
            CODE_CANCELLED => SqlLeaseError::Cancelled,
            _ => SqlLeaseError::Engine(wire),
        }
    }
}

/// Error record that crosses the execution-context boundary.
///
/// Native error values cannot leave the worker, so only the code, the message
/// and the rendered source chain travel back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub(crate) fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

fn render_sources(err: &SqlLeaseError) -> Option<String> {
    let mut lines = Vec::new();
    let mut source = err.source();
    while let Some(inner) = source {
        lines.push(format!("caused by: {inner}"));
        source = inner.source();
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn sqlite_code(err: &rusqlite::Error) -> &'static str {
    use rusqlite::ErrorCode;

    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) => CODE_BUSY,
        Some(ErrorCode::DatabaseLocked) => "SQLITE_LOCKED",
        Some(ErrorCode::ConstraintViolation) => "SQLITE_CONSTRAINT",
        Some(ErrorCode::ReadOnly) => "SQLITE_READONLY",
        Some(ErrorCode::CannotOpen) => "SQLITE_CANTOPEN",
        Some(ErrorCode::DatabaseCorrupt) => "SQLITE_CORRUPT",
        Some(ErrorCode::TypeMismatch) => "SQLITE_MISMATCH",
        Some(ErrorCode::ApiMisuse) => "SQLITE_MISUSE",
        Some(ErrorCode::OutOfMemory) => "SQLITE_NOMEM",
        _ => CODE_GENERIC,
    }
}
