use std::fmt;
use std::sync::Arc;

use crate::config::{DatabaseOptions, DatabaseOptionsBuilder};
use crate::connection::Connection;
use crate::error::SqlLeaseError;
use crate::handle::SqliteManager;
use crate::pool::{PoolStatus, ReadWritePool, ReserveOptions};
use crate::transaction::{BeginTransaction, Transaction, TransactionOptions, TxFuture};
use crate::types::{Params, ResultSet, RunResult};

/// A pooled SQLite database: one writer handle and up to `max_connections`
/// reader handles, each on its own worker thread.
///
/// Readers are separate connections to `path`, so an in-memory path gives
/// every reader its own empty database.
#[derive(Clone)]
pub struct Database {
    pool: ReadWritePool<SqliteManager>,
    options: Arc<DatabaseOptions>,
}

impl Database {
    #[must_use]
    pub fn builder(path: impl Into<String>) -> DatabaseOptionsBuilder {
        DatabaseOptionsBuilder::new(path)
    }

    /// Open the writer and set up the reader pool.
    ///
    /// # Errors
    /// [`SqlLeaseError::ConfigError`] for invalid options, or the engine's
    /// error when the writer cannot be opened.
    pub async fn open(options: DatabaseOptions) -> Result<Self, SqlLeaseError> {
        options.validate()?;
        let writer = Arc::new(SqliteManager::new(
            Arc::clone(&options.engine),
            options.open_options(false),
            options.max_in_flight_batches,
            options.statement_cache_capacity,
        ));
        let readers = Arc::new(SqliteManager::new(
            Arc::clone(&options.engine),
            options.open_options(options.readonly_readers),
            options.max_in_flight_batches,
            options.statement_cache_capacity,
        ));
        let pool = ReadWritePool::open(writer, readers, options.max_connections).await?;
        tracing::debug!(
            path = %options.path,
            max_connections = options.max_connections,
            "database opened"
        );
        Ok(Self {
            pool,
            options: Arc::new(options),
        })
    }

    #[must_use]
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Lease a connection; `options.readonly == Some(true)` picks a reader.
    ///
    /// # Errors
    /// [`SqlLeaseError::Cancelled`], [`SqlLeaseError::PoolClosed`], or an
    /// error opening a new reader.
    pub async fn reserve(&self, options: &ReserveOptions) -> Result<Connection, SqlLeaseError> {
        let lease = self.pool.reserve(options).await?;
        Ok(Connection::new(lease, options.is_readonly()))
    }

    /// # Errors
    /// See [`Database::reserve`].
    pub async fn writer(&self) -> Result<Connection, SqlLeaseError> {
        self.reserve(&ReserveOptions::writer()).await
    }

    /// # Errors
    /// See [`Database::reserve`].
    pub async fn reader(&self) -> Result<Connection, SqlLeaseError> {
        self.reserve(&ReserveOptions::reader()).await
    }

    /// Run a query on a reader.
    ///
    /// # Errors
    /// Reservation or engine error.
    pub async fn select(&self, sql: &str, params: &Params) -> Result<ResultSet, SqlLeaseError> {
        self.reader().await?.select(sql, params).await
    }

    /// Execute a statement on the writer.
    ///
    /// # Errors
    /// Reservation or engine error.
    pub async fn run(&self, sql: &str, params: &Params) -> Result<RunResult, SqlLeaseError> {
        self.writer().await?.run(sql, params).await
    }

    /// A statement usable on any handle; each handle prepares it once.
    #[must_use]
    pub fn prepare(&self, sql: &str) -> PoolStatement {
        PoolStatement {
            db: self.clone(),
            sql: Arc::from(sql),
        }
    }

    /// Run `f` in a transaction on a leased connection (the writer unless
    /// `options.readonly` is `Some(true)`).
    ///
    /// # Errors
    /// See [`Connection::transaction`].
    pub async fn transaction<T, F>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> Result<T, SqlLeaseError>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> TxFuture<'t, T>,
    {
        let mut conn = self.reserve(&route(&options)).await?;
        conn.transaction(options, f).await
    }

    /// Start a transaction that keeps its connection until it finishes.
    ///
    /// # Errors
    /// Reservation error or the `BEGIN` error.
    pub async fn begin(
        &self,
        options: TransactionOptions,
    ) -> Result<BeginTransaction, SqlLeaseError> {
        let conn = self.reserve(&route(&options)).await?;
        conn.begin(options).await
    }

    /// Close every handle. New reservations fail at once; `close` waits for
    /// leased handles to be released and closes them too.
    ///
    /// # Errors
    /// [`SqlLeaseError::CloseFailed`] naming each handle that failed to close,
    /// e.g. because a statement was never finalized.
    pub async fn close(&self) -> Result<(), SqlLeaseError> {
        let outcome = self.pool.close().await;
        tracing::debug!(path = %self.options.path, ok = outcome.is_ok(), "database closed");
        outcome
    }

    #[must_use]
    pub fn writer_status(&self) -> PoolStatus {
        self.pool.writer_status()
    }

    #[must_use]
    pub fn reader_status(&self) -> PoolStatus {
        self.pool.reader_status()
    }
}

fn route(options: &TransactionOptions) -> ReserveOptions {
    ReserveOptions {
        readonly: options.readonly,
        cancel: None,
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.options.path)
            .field("writer", &self.writer_status())
            .field("readers", &self.reader_status())
            .finish()
    }
}

/// SQL prepared lazily on whichever handle serves each call.
///
/// Statements are connection-affine, so every handle keeps its own compiled
/// copy, created the first time that handle runs this SQL.
#[derive(Clone)]
pub struct PoolStatement {
    db: Database,
    sql: Arc<str>,
}

impl PoolStatement {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Run as a query on a reader.
    ///
    /// # Errors
    /// Reservation or engine error.
    pub async fn select(&self, params: &Params) -> Result<ResultSet, SqlLeaseError> {
        self.select_with(&ReserveOptions::reader(), params).await
    }

    /// Run as a query on the handle picked by `options`.
    ///
    /// # Errors
    /// Reservation or engine error.
    pub async fn select_with(
        &self,
        options: &ReserveOptions,
        params: &Params,
    ) -> Result<ResultSet, SqlLeaseError> {
        let conn = self.db.reserve(options).await?;
        conn.handle().select_cached(&self.sql, params).await
    }

    /// Execute on the writer.
    ///
    /// # Errors
    /// Reservation or engine error.
    pub async fn run(&self, params: &Params) -> Result<RunResult, SqlLeaseError> {
        let conn = self.db.writer().await?;
        conn.handle().run_cached(&self.sql, params).await
    }
}

impl fmt::Debug for PoolStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolStatement")
            .field("sql", &self.sql)
            .finish()
    }
}
