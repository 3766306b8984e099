use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Engine, JournalMode, OpenOptions};
use crate::database::Database;
use crate::error::SqlLeaseError;
use crate::handle::DEFAULT_STATEMENT_CACHE_CAPACITY;
use crate::sqlite::RusqliteEngine;
use crate::worker::DEFAULT_MAX_IN_FLIGHT;

/// Options for opening a [`Database`].
#[derive(Clone)]
pub struct DatabaseOptions {
    pub path: String,
    /// Cap on reader handles.
    pub max_connections: usize,
    pub journal_mode: JournalMode,
    pub busy_timeout: Duration,
    /// Open reader handles with `SQLITE_OPEN_READ_ONLY`.
    pub readonly_readers: bool,
    /// Batches a handle may have in flight before new commands are held back
    /// and coalesced.
    pub max_in_flight_batches: usize,
    /// Persisted one-off statements kept per handle; the least recently used
    /// one is finalized when a new one would exceed this.
    pub statement_cache_capacity: usize,
    pub engine: Arc<dyn Engine>,
}

impl DatabaseOptions {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_connections: 4,
            journal_mode: JournalMode::default(),
            busy_timeout: Duration::from_secs(5),
            readonly_readers: true,
            max_in_flight_batches: DEFAULT_MAX_IN_FLIGHT,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
            engine: Arc::new(RusqliteEngine),
        }
    }

    /// # Errors
    /// [`SqlLeaseError::ConfigError`] for an empty path or a zero limit.
    pub fn validate(&self) -> Result<(), SqlLeaseError> {
        if self.path.is_empty() {
            return Err(SqlLeaseError::ConfigError("database path is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(SqlLeaseError::ConfigError(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_in_flight_batches == 0 {
            return Err(SqlLeaseError::ConfigError(
                "max_in_flight_batches must be at least 1".into(),
            ));
        }
        if self.statement_cache_capacity == 0 {
            return Err(SqlLeaseError::ConfigError(
                "statement_cache_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn open_options(&self, readonly: bool) -> OpenOptions {
        OpenOptions {
            path: self.path.clone(),
            readonly,
            journal_mode: self.journal_mode,
            busy_timeout: self.busy_timeout,
        }
    }
}

impl fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("path", &self.path)
            .field("max_connections", &self.max_connections)
            .field("journal_mode", &self.journal_mode)
            .field("busy_timeout", &self.busy_timeout)
            .field("readonly_readers", &self.readonly_readers)
            .field("max_in_flight_batches", &self.max_in_flight_batches)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`DatabaseOptions`].
#[derive(Debug, Clone)]
pub struct DatabaseOptionsBuilder {
    opts: DatabaseOptions,
}

impl DatabaseOptionsBuilder {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            opts: DatabaseOptions::new(path),
        }
    }

    #[must_use]
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.opts.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn journal_mode(mut self, journal_mode: JournalMode) -> Self {
        self.opts.journal_mode = journal_mode;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.opts.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn readonly_readers(mut self, readonly_readers: bool) -> Self {
        self.opts.readonly_readers = readonly_readers;
        self
    }

    #[must_use]
    pub fn max_in_flight_batches(mut self, max_in_flight_batches: usize) -> Self {
        self.opts.max_in_flight_batches = max_in_flight_batches;
        self
    }

    #[must_use]
    pub fn statement_cache_capacity(mut self, statement_cache_capacity: usize) -> Self {
        self.opts.statement_cache_capacity = statement_cache_capacity;
        self
    }

    /// Use a different capability binding.
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.opts.engine = engine;
        self
    }

    #[must_use]
    pub fn finish(self) -> DatabaseOptions {
        self.opts
    }

    /// Validate the options and open the database.
    ///
    /// # Errors
    ///
    /// Returns `SqlLeaseError` if validation fails or the writer cannot be opened.
    pub async fn build(self) -> Result<Database, SqlLeaseError> {
        Database::open(self.finish()).await
    }
}
