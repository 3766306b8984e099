use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use clap::ValueEnum;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, PreparedQuery};
use crate::error::SqlLeaseError;
use crate::pipeline::Pipeline;
use crate::types::{Params, ResultSet, RunResult};

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

/// Future returned by a [`Connection::transaction`] body.
pub type TxFuture<'t, T> = BoxFuture<'t, Result<T, SqlLeaseError>>;

/// When the write lock is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionKind {
    #[must_use]
    pub fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN DEFERRED",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Defaults to exclusive on the writer and deferred on readers.
    #[serde(default, rename = "type")]
    pub kind: Option<TransactionKind>,
    /// Pool routing for `Database::transaction`/`Database::begin`.
    #[serde(default)]
    pub readonly: Option<bool>,
}

impl TransactionOptions {
    #[must_use]
    pub fn kind(kind: TransactionKind) -> Self {
        Self {
            kind: Some(kind),
            readonly: None,
        }
    }

    /// A deferred transaction on a reader.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            kind: Some(TransactionKind::Deferred),
            readonly: Some(true),
        }
    }

    #[must_use]
    pub fn resolve(&self, readonly: bool) -> TransactionKind {
        self.kind.unwrap_or(if readonly {
            TransactionKind::Deferred
        } else {
            TransactionKind::Exclusive
        })
    }
}

/// Roll back, retrying on `SQLITE_BUSY` with a short backoff.
pub(crate) async fn rollback_with_busy_retries(conn: &Connection) -> Result<(), SqlLeaseError> {
    for (idx, delay) in ROLLBACK_BUSY_RETRIES.iter().copied().enumerate() {
        match conn.run("ROLLBACK", &Params::none()).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_busy() && idx + 1 < ROLLBACK_BUSY_RETRIES.len() => {
                tracing::debug!(
                    handle = %conn.name(),
                    attempt = idx + 1,
                    "rollback busy; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(SqlLeaseError::ConnectionError(
        "rollback retries exhausted".into(),
    ))
}

/// View of a connection inside a [`Connection::transaction`] body.
///
/// Every query method of [`Connection`] is available through `Deref`.
pub struct Transaction<'c> {
    conn: &'c Connection,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl Deref for Transaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("connection", &self.conn.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A transaction that owns its connection until it finishes.
///
/// `commit` and `rollback` are no-ops once either has run. The connection goes
/// back to its pool only after the transaction reaches a terminal state;
/// dropping an active transaction rolls it back first. Queries after the end
/// are rejected.
pub struct BeginTransaction {
    conn: Option<Connection>,
    state: TransactionState,
    kind: TransactionKind,
}

impl BeginTransaction {
    pub(crate) async fn start(
        conn: Connection,
        options: TransactionOptions,
    ) -> Result<Self, SqlLeaseError> {
        let kind = options.resolve(conn.is_readonly());
        conn.run(kind.begin_sql(), &Params::none()).await?;
        tracing::debug!(handle = %conn.name(), ?kind, "transaction started");
        Ok(Self {
            conn: Some(conn),
            state: TransactionState::Active,
            kind,
        })
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// The underlying connection while the transaction is active.
    ///
    /// # Errors
    /// [`SqlLeaseError::ProtocolViolation`] after commit or rollback.
    pub fn connection(&self) -> Result<&Connection, SqlLeaseError> {
        match (&self.conn, self.state) {
            (Some(conn), TransactionState::Active) => Ok(conn),
            (_, state) => Err(SqlLeaseError::protocol(format!(
                "transaction is no longer active ({state:?}); it cannot run queries"
            ))),
        }
    }

    /// # Errors
    /// See [`Connection::prepare`]; also fails once the transaction ended.
    pub fn prepare(&self, sql: &str) -> Result<PreparedQuery<'_>, SqlLeaseError> {
        self.connection()?.prepare(sql)
    }

    /// # Errors
    /// See [`Connection::select`]; also fails once the transaction ended.
    pub async fn select(&self, sql: &str, params: &Params) -> Result<ResultSet, SqlLeaseError> {
        self.connection()?.select(sql, params).await
    }

    /// # Errors
    /// See [`Connection::run`]; also fails once the transaction ended.
    pub async fn run(&self, sql: &str, params: &Params) -> Result<RunResult, SqlLeaseError> {
        self.connection()?.run(sql, params).await
    }

    /// # Errors
    /// Fails once the transaction ended.
    pub fn pipeline(&self) -> Result<Pipeline<'_>, SqlLeaseError> {
        Ok(self.connection()?.pipeline())
    }

    /// Commit. If `COMMIT` fails the transaction is rolled back and the commit
    /// error returned. No-op once finished.
    ///
    /// # Errors
    /// The `COMMIT` error.
    pub async fn commit(&mut self) -> Result<(), SqlLeaseError> {
        let Some(conn) = self.active_connection() else {
            return Ok(());
        };
        match conn.run("COMMIT", &Params::none()).await {
            Ok(_) => {
                tracing::debug!(handle = %conn.name(), "transaction committed");
                self.finish(TransactionState::Committed, false);
                Ok(())
            }
            Err(err) => {
                let rolled_back = rollback_with_busy_retries(conn).await;
                let broken = match rolled_back {
                    Ok(()) => false,
                    Err(rollback_err) => {
                        tracing::warn!(
                            handle = %conn.name(),
                            error = %rollback_err,
                            "rollback failed after commit error"
                        );
                        rollback_err.is_busy()
                    }
                };
                self.finish(TransactionState::RolledBack, broken);
                Err(err)
            }
        }
    }

    /// Roll back. No-op once finished.
    ///
    /// # Errors
    /// The `ROLLBACK` error. A handle still busy after the retries is evicted
    /// when the transaction releases it.
    pub async fn rollback(&mut self) -> Result<(), SqlLeaseError> {
        let Some(conn) = self.active_connection() else {
            return Ok(());
        };
        let outcome = rollback_with_busy_retries(conn).await;
        let broken = match &outcome {
            Ok(()) => {
                tracing::debug!(handle = %conn.name(), "transaction rolled back");
                false
            }
            Err(err) => {
                tracing::warn!(handle = %conn.name(), error = %err, "rollback failed");
                err.is_busy()
            }
        };
        self.finish(TransactionState::RolledBack, broken);
        outcome
    }

    fn active_connection(&self) -> Option<&Connection> {
        match self.state {
            TransactionState::Active => self.conn.as_ref(),
            TransactionState::Committed | TransactionState::RolledBack => None,
        }
    }

    /// Enter a terminal state and give the connection back to its pool.
    fn finish(&mut self, state: TransactionState, broken: bool) {
        self.state = state;
        if let Some(mut conn) = self.conn.take() {
            if broken {
                conn.mark_broken();
            }
            conn.release();
        }
    }
}

impl Drop for BeginTransaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        self.state = TransactionState::RolledBack;
        let Some(conn) = self.conn.take() else {
            return;
        };
        tracing::debug!(handle = %conn.name(), "dropping active transaction; rolling back");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut conn = conn;
                    if let Err(err) = rollback_with_busy_retries(&conn).await {
                        tracing::warn!(
                            handle = %conn.name(),
                            error = %err,
                            "rollback on drop failed"
                        );
                        if err.is_busy() {
                            conn.mark_broken();
                        }
                    }
                });
            }
            Err(_) => {
                if let Err(err) = conn.handle().run_cached_detached("ROLLBACK") {
                    tracing::warn!(handle = %conn.name(), error = %err, "failed to queue rollback");
                }
            }
        }
    }
}

impl fmt::Debug for BeginTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeginTransaction")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("connection", &self.conn.as_ref().map(Connection::name))
            .finish()
    }
}
