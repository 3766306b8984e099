use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, Stream};

use crate::capability::PrepareOptions;
use crate::error::SqlLeaseError;
use crate::handle::{SqliteHandle, take_reply};
use crate::pipeline::Pipeline;
use crate::pool::Lease;
use crate::transaction::{
    BeginTransaction, Transaction, TransactionOptions, TxFuture, rollback_with_busy_retries,
};
use crate::types::{Params, ResultSet, RunResult};
use crate::worker::{Command, StatementId, Ticket, settle_all};

/// A leased physical connection.
///
/// Dropping it returns the handle to its pool. Only one `Connection` exists
/// per handle at a time, so everything issued through it runs in order.
pub struct Connection {
    lease: Lease<SqliteHandle>,
    readonly: bool,
}

impl Connection {
    pub(crate) fn new(lease: Lease<SqliteHandle>, readonly: bool) -> Self {
        Self { lease, readonly }
    }

    /// Name of the handle (`writer`, `connection-{n}`).
    #[must_use]
    pub fn name(&self) -> &str {
        self.lease.name()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn handle(&self) -> &SqliteHandle {
        &self.lease
    }

    pub(crate) fn mark_broken(&mut self) {
        self.lease.mark_broken();
    }

    /// Prepare `sql` on this connection. Compile errors surface on first use.
    ///
    /// # Errors
    /// [`SqlLeaseError::ProtocolViolation`] when the statement id space is
    /// exhausted.
    pub fn prepare(&self, sql: &str) -> Result<PreparedQuery<'_>, SqlLeaseError> {
        let client = self.handle().client();
        let id = client.allocate_id()?;
        client.send(Command::Prepare {
            id,
            sql: sql.to_string(),
            options: PrepareOptions::default(),
        });
        Ok(PreparedQuery {
            conn: self,
            id,
            sql: Arc::from(sql),
            finalized: false,
        })
    }

    /// Prepare `sql` and bind initial parameters.
    ///
    /// # Errors
    /// See [`Connection::prepare`]; a bind failure is returned here.
    pub async fn prepare_with(
        &self,
        sql: &str,
        params: &Params,
    ) -> Result<PreparedQuery<'_>, SqlLeaseError> {
        let query = self.prepare(sql)?;
        query.bind(params).await?;
        Ok(query)
    }

    /// Run a one-off query through the handle's statement cache.
    ///
    /// # Errors
    /// Any engine error for `sql`.
    pub async fn select(&self, sql: &str, params: &Params) -> Result<ResultSet, SqlLeaseError> {
        self.handle().select_cached(sql, params).await
    }

    /// Execute a one-off statement through the handle's statement cache.
    ///
    /// # Errors
    /// Any engine error for `sql`.
    pub async fn run(&self, sql: &str, params: &Params) -> Result<RunResult, SqlLeaseError> {
        self.handle().run_cached(sql, params).await
    }

    /// Change count and last rowid of the most recent write on this handle.
    ///
    /// # Errors
    /// Transport or engine error.
    pub async fn changes(&self) -> Result<RunResult, SqlLeaseError> {
        self.handle()
            .client()
            .push(Command::GetChanges)
            .await?
            .into_run()
    }

    /// Round trip to the worker, returning any error kept from earlier
    /// fire-and-forget commands.
    ///
    /// # Errors
    /// The oldest pending error.
    pub async fn sync(&self) -> Result<(), SqlLeaseError> {
        self.handle().client().sync().await
    }

    #[must_use]
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise (also when the commit
    /// itself fails). A rollback failure during that cleanup is logged and the
    /// original error is returned.
    ///
    /// # Errors
    /// The error from `BEGIN`, from `f`, or from `COMMIT`.
    pub async fn transaction<T, F>(
        &mut self,
        options: TransactionOptions,
        f: F,
    ) -> Result<T, SqlLeaseError>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> TxFuture<'t, T>,
    {
        let kind = options.resolve(self.readonly);
        self.run(kind.begin_sql(), &Params::none()).await?;
        tracing::debug!(handle = %self.name(), ?kind, "transaction started");

        let outcome = {
            let conn: &Connection = self;
            let mut guard = RollbackGuard { conn: Some(conn) };
            let body = {
                let mut tx = Transaction::new(conn);
                f(&mut tx).await
            };
            let outcome = match body {
                Ok(value) => conn.run("COMMIT", &Params::none()).await.map(|_| value),
                Err(err) => Err(err),
            };
            guard.disarm();
            outcome
        };

        match outcome {
            Ok(value) => {
                tracing::debug!(handle = %self.name(), "transaction committed");
                Ok(value)
            }
            Err(err) => {
                match rollback_with_busy_retries(self).await {
                    Ok(()) => tracing::debug!(handle = %self.name(), "transaction rolled back"),
                    Err(rollback_err) => {
                        tracing::warn!(
                            handle = %self.name(),
                            error = %rollback_err,
                            "rollback failed after transaction error"
                        );
                        if rollback_err.is_busy() {
                            self.mark_broken();
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Start a transaction that holds this connection until it is committed
    /// or rolled back. Dropping it unfinished rolls back.
    ///
    /// # Errors
    /// The error from `BEGIN`.
    pub async fn begin(
        self,
        options: TransactionOptions,
    ) -> Result<BeginTransaction, SqlLeaseError> {
        BeginTransaction::start(self, options).await
    }

    /// Persisted one-off statements currently cached on this handle.
    #[must_use]
    pub fn cached_statements(&self) -> usize {
        self.handle().cached_statements()
    }

    /// Return the handle to its pool.
    pub fn release(self) {
        drop(self);
    }
}

/// Queues a rollback if a transaction body is abandoned mid-flight.
struct RollbackGuard<'a> {
    conn: Option<&'a Connection>,
}

impl RollbackGuard<'_> {
    fn disarm(&mut self) {
        self.conn = None;
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(handle = %conn.name(), "transaction abandoned; queueing rollback");
            if let Err(err) = conn.handle().run_cached_detached("ROLLBACK") {
                tracing::warn!(handle = %conn.name(), error = %err, "failed to queue rollback");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("readonly", &self.readonly)
            .finish()
    }
}

/// A statement prepared on one [`Connection`].
///
/// Finalized on drop; [`PreparedQuery::finalize`] is the explicit form.
pub struct PreparedQuery<'c> {
    conn: &'c Connection,
    id: StatementId,
    sql: Arc<str>,
    finalized: bool,
}

impl<'c> PreparedQuery<'c> {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn id(&self) -> StatementId {
        self.id
    }

    pub(crate) fn connection(&self) -> &'c Connection {
        self.conn
    }

    fn enqueue(&self, command: Command) -> Ticket {
        self.conn.handle().client().enqueue(command)
    }

    /// Overwrite the given parameter slots; others keep their values.
    ///
    /// # Errors
    /// Unknown names or out-of-range positions.
    pub async fn bind(&self, params: &Params) -> Result<(), SqlLeaseError> {
        self.enqueue(Command::Bind {
            id: self.id,
            params: params.clone(),
        })
        .settle()
        .await
        .map(|_| ())
    }

    fn queue_bind(&self, params: &Params, tickets: &mut Vec<Ticket>) {
        if !params.is_empty() {
            tickets.push(self.enqueue(Command::Bind {
                id: self.id,
                params: params.clone(),
            }));
        }
    }

    /// Column names as the current schema defines them.
    ///
    /// # Errors
    /// The deferred compile error, if any.
    pub async fn columns(&self) -> Result<Arc<Vec<String>>, SqlLeaseError> {
        let columns = self
            .enqueue(Command::Parse { id: self.id })
            .settle()
            .await?
            .into_columns()?;
        Ok(Arc::new(columns))
    }

    /// Bind `params` (if any), read every row, then reset.
    ///
    /// # Errors
    /// The first failure among bind, step and reset.
    pub async fn select(&self, params: &Params) -> Result<ResultSet, SqlLeaseError> {
        let mut tickets = Vec::new();
        self.queue_bind(params, &mut tickets);
        tickets.push(self.enqueue(Command::Step {
            id: self.id,
            count: None,
        }));
        let step_at = tickets.len() - 1;
        tickets.push(self.enqueue(Command::Reset {
            id: self.id,
            clear_bindings: false,
        }));

        let mut replies = settle_all(tickets).await?;
        let step = take_reply(&mut replies, step_at).into_step()?;
        Ok(ResultSet::from_raw(Arc::new(step.columns), step.rows))
    }

    /// Bind `params` (if any) and read rows lazily, `chunk_size` at a time.
    ///
    /// The statement is reset when the stream is dropped, finished or not.
    ///
    /// # Errors
    /// The bind or compile error.
    pub async fn stream(
        &self,
        params: &Params,
        chunk_size: usize,
    ) -> Result<RowStream<'_, 'c>, SqlLeaseError> {
        let mut tickets = Vec::new();
        self.queue_bind(params, &mut tickets);
        settle_all(tickets).await?;
        let columns = self.columns().await?;
        Ok(RowStream {
            query: self,
            columns,
            chunk_size: chunk_size.max(1),
            done: false,
        })
    }

    /// Bind `params` (if any) and execute for side effects.
    ///
    /// # Errors
    /// The first failure among bind and run.
    pub async fn run(&self, params: &Params) -> Result<RunResult, SqlLeaseError> {
        let mut tickets = Vec::new();
        self.queue_bind(params, &mut tickets);
        tickets.push(self.enqueue(Command::Run { id: self.id }));
        let mut replies = settle_all(tickets).await?;
        match replies.pop() {
            Some(reply) => reply.into_run(),
            None => Err(SqlLeaseError::protocol("run produced no reply")),
        }
    }

    /// Queue a run without waiting for it.
    pub(crate) fn enqueue_run(&self, params: &Params) -> Vec<Ticket> {
        let mut tickets = Vec::new();
        self.queue_bind(params, &mut tickets);
        tickets.push(self.enqueue(Command::Run { id: self.id }));
        tickets
    }

    /// Release the statement. Further use is impossible by construction.
    pub fn finalize(mut self) {
        self.release_statement();
    }

    fn release_statement(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.conn.handle().client().finalize(self.id);
        }
    }
}

impl Drop for PreparedQuery<'_> {
    fn drop(&mut self) {
        self.release_statement();
    }
}

impl fmt::Debug for PreparedQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedQuery")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .field("connection", &self.conn.name())
            .finish()
    }
}

/// Rows of a [`PreparedQuery`] delivered in chunks.
pub struct RowStream<'q, 'c> {
    query: &'q PreparedQuery<'c>,
    columns: Arc<Vec<String>>,
    chunk_size: usize,
    done: bool,
}

impl RowStream<'_, '_> {
    /// The next chunk, or `None` once the statement is exhausted.
    ///
    /// # Errors
    /// Engine error while stepping.
    pub async fn next_chunk(&mut self) -> Result<Option<ResultSet>, SqlLeaseError> {
        if self.done {
            return Ok(None);
        }
        let step = self
            .query
            .enqueue(Command::Step {
                id: self.query.id,
                count: Some(self.chunk_size),
            })
            .settle()
            .await;
        let step = match step.and_then(|reply| reply.into_step()) {
            Ok(step) => step,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };
        self.done = step.done;
        if step.rows.is_empty() {
            return Ok(None);
        }
        if !step.columns.is_empty() && step.columns != *self.columns {
            self.columns = Arc::new(step.columns);
        }
        Ok(Some(ResultSet::from_raw(
            Arc::clone(&self.columns),
            step.rows,
        )))
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Adapt into a `futures` stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<ResultSet, SqlLeaseError>> {
        stream::unfold(self, |mut rows| async move {
            match rows.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), rows)),
                Ok(None) => None,
                Err(err) => Some((Err(err), rows)),
            }
        })
    }
}

impl Drop for RowStream<'_, '_> {
    fn drop(&mut self) {
        self.query.conn.handle().client().send(Command::Reset {
            id: self.query.id,
            clear_bindings: false,
        });
    }
}

impl fmt::Debug for RowStream<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("sql", &self.query.sql)
            .field("chunk_size", &self.chunk_size)
            .field("done", &self.done)
            .finish()
    }
}
