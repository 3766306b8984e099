//! Contract a physical database binding must satisfy.
//!
//! Everything above this module (pools, transport, lifecycle layer) talks to
//! the engine only through these traits. A connection and its statements live
//! on a single execution context and are never shared across threads, so the
//! traits carry no `Send` bound; only the [`Engine`] that opens them does.

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SqlLeaseError;
use crate::types::{Params, RunResult, StepResult};

/// Opens physical connections. Selected once when a pool is constructed.
pub trait Engine: Send + Sync + 'static {
    /// Open one connection.
    ///
    /// # Errors
    /// Returns an engine error if the database cannot be opened or configured.
    fn open(&self, options: &OpenOptions) -> Result<Box<dyn Connection>, SqlLeaseError>;
}

/// One physical connection.
pub trait Connection {
    /// Compile `sql` into a statement.
    ///
    /// Compilation errors are deferred: the returned statement reports them from
    /// `columns`, `step`, or `run`.
    ///
    /// # Errors
    /// Only fails when the connection itself is unusable (e.g. already closed).
    fn prepare(
        &mut self,
        sql: &str,
        options: PrepareOptions,
    ) -> Result<Box<dyn Statement>, SqlLeaseError>;

    /// Close the connection.
    ///
    /// # Errors
    /// Returns [`SqlLeaseError::ResourceLeak`] naming the first outstanding
    /// non-persisted statement; the connection stays open in that case.
    fn close(&mut self) -> Result<(), SqlLeaseError>;
}

/// One compiled query bound to a [`Connection`].
pub trait Statement {
    /// Overwrite the provided parameter slots.
    ///
    /// While the SQL does not compile the values are stored unchecked and the
    /// compile error is left for `columns`, `step`, or `run` to report.
    ///
    /// # Errors
    /// Returns an error for unknown parameter names or out-of-range positions.
    fn bind(&mut self, params: &Params) -> Result<(), SqlLeaseError>;

    /// Return up to `count` rows (all remaining when `None`), advancing the
    /// engine no further than that. Stepping a finished statement yields an
    /// empty, done result. A statement that failed to compile is compiled
    /// again first.
    ///
    /// # Errors
    /// Returns the deferred prepare error or an engine error.
    fn step(&mut self, count: Option<usize>) -> Result<StepResult, SqlLeaseError>;

    /// Execute for side effects.
    ///
    /// # Errors
    /// Returns the deferred prepare error or an engine error.
    fn run(&mut self) -> Result<RunResult, SqlLeaseError>;

    /// Column names against the current schema.
    ///
    /// # Errors
    /// Returns the deferred prepare error.
    fn columns(&mut self) -> Result<Vec<String>, SqlLeaseError>;

    /// # Errors
    /// Returns an error when the statement was finalized.
    fn reset(&mut self, clear_bindings: bool) -> Result<(), SqlLeaseError>;

    /// Release native resources. Idempotent.
    ///
    /// # Errors
    /// Engine-specific; the rusqlite binding never fails here.
    fn finalize(&mut self) -> Result<(), SqlLeaseError>;
}

/// Per-statement options passed to [`Connection::prepare`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOptions {
    /// Kept alive across logical operations and exempt from leak detection.
    #[serde(default)]
    pub persist: bool,
}

impl PrepareOptions {
    #[must_use]
    pub fn persisted() -> Self {
        Self { persist: true }
    }
}

/// SQLite journaling mode applied to writable connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Memory,
    Off,
}

impl JournalMode {
    #[must_use]
    pub fn as_pragma(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Memory => "MEMORY",
            JournalMode::Off => "OFF",
        }
    }
}

/// Options forwarded verbatim to [`Engine::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub path: String,
    pub readonly: bool,
    pub journal_mode: JournalMode,
    pub busy_timeout: Duration,
}

impl OpenOptions {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            readonly: false,
            journal_mode: JournalMode::default(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}
