use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};

use crate::error::SqlLeaseError;
use crate::pool::lock;

use super::channel::{Command, Reply, Response};
use super::ids::{StatementId, StatementIds};
use super::manager::{WorkerHandle, connection_error};

/// In-flight batches allowed per handle unless configured otherwise.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

type Responder = oneshot::Sender<Result<Reply, SqlLeaseError>>;

struct Queued {
    command: Command,
    responder: Option<Responder>,
}

#[derive(Default)]
struct ClientState {
    buffer: Vec<Queued>,
    pending_error: Option<SqlLeaseError>,
    closed: bool,
}

struct ClientInner {
    worker: WorkerHandle,
    state: Mutex<ClientState>,
    wake: Notify,
    gate: Arc<Semaphore>,
    ids: Mutex<StatementIds>,
}

impl ClientInner {
    fn record_failure(&self, err: SqlLeaseError) {
        let mut state = lock(&self.state);
        if state.pending_error.is_none() {
            state.pending_error = Some(err);
        }
    }
}

/// Caller side of the command transport for one handle.
///
/// Commands are buffered and shipped to the worker in batches by a background
/// flush loop. While batches are in flight (at most `max_in_flight`), new
/// commands accumulate and go out together in the next one.
pub struct CommandClient {
    inner: Arc<ClientInner>,
}

impl CommandClient {
    /// Wrap a worker and start the flush loop on the current tokio runtime.
    pub(crate) fn start(worker: WorkerHandle, max_in_flight: usize) -> Self {
        let inner = Arc::new(ClientInner {
            worker,
            state: Mutex::new(ClientState::default()),
            wake: Notify::new(),
            gate: Arc::new(Semaphore::new(max_in_flight.max(1))),
            ids: Mutex::new(StatementIds::new()),
        });
        tokio::spawn(flush_loop(Arc::clone(&inner)));
        Self { inner }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.worker.name()
    }

    fn buffer(&self, command: Command, responder: Option<Responder>) {
        let mut state = lock(&self.inner.state);
        if state.closed {
            let err = connection_error("command client is closed");
            match responder {
                Some(responder) => {
                    let _ = responder.send(Err(err));
                }
                None => {
                    if state.pending_error.is_none() {
                        state.pending_error = Some(err);
                    }
                }
            }
            return;
        }
        state.buffer.push(Queued { command, responder });
        drop(state);
        self.inner.wake.notify_one();
    }

    /// Fire and forget. A failure is kept and reported by the next [`sync`].
    ///
    /// [`sync`]: CommandClient::sync
    pub fn send(&self, command: Command) {
        self.buffer(command, None);
    }

    /// Buffer `command` and return a ticket for its response.
    #[must_use = "dropping a ticket turns its command into fire-and-forget"]
    pub fn enqueue(&self, command: Command) -> Ticket {
        let (tx, rx) = oneshot::channel();
        self.buffer(command, Some(tx));
        Ticket { rx }
    }

    /// Buffer `command` and wait for its response.
    ///
    /// # Errors
    /// The command's own error, or [`SqlLeaseError::ConnectionError`] if the
    /// worker went away.
    pub async fn push(&self, command: Command) -> Result<Reply, SqlLeaseError> {
        self.enqueue(command).settle().await
    }

    /// Force a round trip and surface any error kept from earlier
    /// fire-and-forget commands.
    ///
    /// # Errors
    /// The oldest pending error, or a transport failure of the sync itself.
    pub async fn sync(&self) -> Result<(), SqlLeaseError> {
        self.push(Command::Sync).await?;
        match self.take_pending_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn take_pending_error(&self) -> Option<SqlLeaseError> {
        lock(&self.inner.state).pending_error.take()
    }

    /// # Errors
    /// [`SqlLeaseError::ProtocolViolation`] when the id space is exhausted.
    pub fn allocate_id(&self) -> Result<StatementId, SqlLeaseError> {
        lock(&self.inner.ids).allocate()
    }

    /// Send `finalize` for `id` and make the id available again.
    pub fn finalize(&self, id: StatementId) {
        self.send(Command::Finalize { id });
        lock(&self.inner.ids).release(id);
    }

    /// Flush, then close the worker's connection.
    ///
    /// # Errors
    /// [`SqlLeaseError::ResourceLeak`] if a non-persisted statement is still
    /// live, or a transport error.
    pub async fn close(&self) -> Result<(), SqlLeaseError> {
        if let Err(err) = self.sync().await {
            tracing::warn!(handle = %self.name(), error = %err, "pending error discarded at close");
        }
        self.inner.worker.close().await?;
        lock(&self.inner.state).closed = true;
        self.inner.wake.notify_one();
        Ok(())
    }
}

impl Drop for CommandClient {
    fn drop(&mut self) {
        lock(&self.inner.state).closed = true;
        self.inner.wake.notify_one();
    }
}

impl fmt::Debug for CommandClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CommandClient")
            .field("name", &self.name())
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Pending response of one enqueued command.
///
/// Dropping an unsettled ticket is allowed; an error for it is then kept for
/// the next `sync`.
#[derive(Debug)]
pub struct Ticket {
    rx: oneshot::Receiver<Result<Reply, SqlLeaseError>>,
}

impl Ticket {
    /// # Errors
    /// The command's error, or [`SqlLeaseError::ConnectionError`] when the
    /// transport dropped it.
    pub async fn settle(self) -> Result<Reply, SqlLeaseError> {
        self.rx
            .await
            .map_err(|_| connection_error("command dropped before it completed"))?
    }
}

/// Settle every ticket and return the first error, if any.
///
/// # Errors
/// The earliest failure among `tickets`.
pub async fn settle_all(
    tickets: impl IntoIterator<Item = Ticket>,
) -> Result<Vec<Reply>, SqlLeaseError> {
    let mut replies = Vec::new();
    let mut first_error = None;
    for ticket in tickets {
        match ticket.settle().await {
            Ok(reply) => replies.push(reply),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(replies),
    }
}

/// A submitted batch waiting for its responses.
struct InFlight {
    responses: oneshot::Receiver<Vec<Response>>,
    responders: Vec<Option<Responder>>,
    _permit: OwnedSemaphorePermit,
}

async fn flush_loop(inner: Arc<ClientInner>) {
    let (in_flight, receiver) = mpsc::unbounded_channel();
    tokio::spawn(settle_loop(Arc::clone(&inner), receiver));
    loop {
        let has_work = {
            let state = lock(&inner.state);
            if state.buffer.is_empty() && state.closed {
                break;
            }
            !state.buffer.is_empty()
        };
        if !has_work {
            inner.wake.notified().await;
            continue;
        }

        // Wait for a free slot first so commands keep piling into this batch.
        let Ok(permit) = Arc::clone(&inner.gate).acquire_owned().await else {
            break;
        };
        let batch = std::mem::take(&mut lock(&inner.state).buffer);
        if batch.is_empty() {
            continue;
        }
        let (commands, responders): (Vec<Command>, Vec<Option<Responder>>) = batch
            .into_iter()
            .map(|queued| (queued.command, queued.responder))
            .unzip();
        tracing::trace!(handle = %inner.worker.name(), commands = commands.len(), "flushing batch");

        match inner.worker.submit(commands) {
            Ok(responses) => {
                let batch = InFlight {
                    responses,
                    responders,
                    _permit: permit,
                };
                if let Err(mpsc::error::SendError(batch)) = in_flight.send(batch) {
                    fail_batch(&inner, batch.responders, || {
                        connection_error("command client stopped")
                    });
                }
            }
            Err(err) => {
                drop(permit);
                let message = err.to_string();
                fail_batch(&inner, responders, || {
                    SqlLeaseError::ConnectionError(message.clone())
                });
            }
        }
    }
}

/// Resolve batches strictly in submission order.
async fn settle_loop(inner: Arc<ClientInner>, mut receiver: mpsc::UnboundedReceiver<InFlight>) {
    while let Some(batch) = receiver.recv().await {
        let InFlight {
            responses,
            responders,
            _permit,
        } = batch;
        match responses.await {
            Ok(responses) => dispatch(&inner, responders, responses),
            Err(_) => fail_batch(&inner, responders, || {
                connection_error("SQLite worker dropped a batch")
            }),
        }
    }
}

fn dispatch(inner: &ClientInner, responders: Vec<Option<Responder>>, responses: Vec<Response>) {
    if responders.len() != responses.len() {
        let message = format!(
            "batch of {} commands got {} responses",
            responders.len(),
            responses.len()
        );
        fail_batch(inner, responders, || SqlLeaseError::protocol(message.clone()));
        return;
    }
    for (responder, response) in responders.into_iter().zip(responses) {
        deliver(inner, responder, response.into_result());
    }
}

fn fail_batch(
    inner: &ClientInner,
    responders: Vec<Option<Responder>>,
    make_error: impl Fn() -> SqlLeaseError,
) {
    for responder in responders {
        deliver(inner, responder, Err(make_error()));
    }
}

fn deliver(
    inner: &ClientInner,
    responder: Option<Responder>,
    result: Result<Reply, SqlLeaseError>,
) {
    let unclaimed = match responder {
        Some(responder) => responder.send(result).err(),
        None => Some(result),
    };
    if let Some(Err(err)) = unclaimed {
        tracing::warn!(handle = %inner.worker.name(), error = %err, "unobserved command failed");
        inner.record_failure(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{OpenOptions, PrepareOptions};
    use crate::sqlite::RusqliteEngine;
    use crate::types::{Params, Value};

    async fn client() -> CommandClient {
        let worker = WorkerHandle::spawn(
            Arc::new(RusqliteEngine),
            OpenOptions::new(":memory:"),
            Arc::from("test"),
        )
        .await
        .expect("spawn worker");
        CommandClient::start(worker, DEFAULT_MAX_IN_FLIGHT)
    }

    fn prepare(id: StatementId, sql: &str) -> Command {
        Command::Prepare {
            id,
            sql: sql.to_string(),
            options: PrepareOptions::default(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tickets_resolve_in_submission_order() -> Result<(), SqlLeaseError> {
        let client = client().await;
        client.send(prepare(0, "CREATE TABLE t (x INTEGER)"));
        client.send(Command::Run { id: 0 });
        client.finalize(0);

        let insert = client.allocate_id()?;
        assert_eq!(insert, 0);
        client.send(prepare(insert, "INSERT INTO t VALUES (?)"));
        let mut tickets = Vec::new();
        for i in 0..100_i64 {
            client.send(Command::Bind {
                id: insert,
                params: Params::positional([i]),
            });
            tickets.push(client.enqueue(Command::Run { id: insert }));
        }
        let replies = settle_all(tickets).await?;
        let last = replies.last().cloned().expect("replies").into_run()?;
        assert_eq!(last.last_insert_row_id, 100);
        client.finalize(insert);

        client.send(prepare(1, "SELECT count(*) FROM t"));
        let step = client.push(Command::Step { id: 1, count: None }).await?.into_step()?;
        assert_eq!(step.rows, vec![vec![Value::Integer(100)]]);
        client.finalize(1);
        client.sync().await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sync_surfaces_fire_and_forget_failures() -> Result<(), SqlLeaseError> {
        let client = client().await;
        client.send(Command::Run { id: 42 });
        let err = client.sync().await.unwrap_err();
        assert!(matches!(err, SqlLeaseError::ProtocolViolation(_)));
        // reported once
        client.sync().await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropped_ticket_failure_is_kept() -> Result<(), SqlLeaseError> {
        let client = client().await;
        drop(client.enqueue(prepare(3, "SELECT 1")));
        drop(client.enqueue(prepare(3, "SELECT 2")));
        assert!(client.sync().await.is_err());
        client.finalize(3);
        client.sync().await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_reports_leaks_and_stays_usable() -> Result<(), SqlLeaseError> {
        let client = client().await;
        client.send(prepare(0, "SELECT 1 AS leaked"));
        match client.close().await {
            Err(SqlLeaseError::ResourceLeak { sql }) => assert_eq!(sql, "SELECT 1 AS leaked"),
            other => panic!("expected leak, got {other:?}"),
        }
        client.finalize(0);
        client.close().await?;
        let after = client.push(Command::Sync).await;
        assert!(matches!(after, Err(SqlLeaseError::ConnectionError(_))));
        Ok(())
    }
}
