use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;

use tokio::sync::oneshot;

use crate::capability::{Engine, OpenOptions};
use crate::error::SqlLeaseError;

use super::channel::{Command, Response, WorkerMessage};
use super::dispatcher::{BatchExecutor, run_worker};

/// Owner side of a worker thread that holds one capability connection.
pub(crate) struct WorkerHandle {
    sender: Sender<WorkerMessage>,
    name: Arc<str>,
}

impl WorkerHandle {
    /// Spawn `sqlite-worker-{name}` and open the connection on it.
    pub(crate) async fn spawn(
        engine: Arc<dyn Engine>,
        options: OpenOptions,
        name: Arc<str>,
    ) -> Result<Self, SqlLeaseError> {
        let (sender, receiver) = mpsc::channel::<WorkerMessage>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), SqlLeaseError>>();
        thread::Builder::new()
            .name(format!("sqlite-worker-{name}"))
            .spawn(move || match engine.open(&options) {
                Ok(connection) => {
                    let _ = ready_tx.send(Ok(()));
                    run_worker(BatchExecutor::new(connection), &receiver);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(|err| {
                SqlLeaseError::ConnectionError(format!(
                    "failed to spawn SQLite worker thread: {err}"
                ))
            })?;

        ready_rx
            .await
            .map_err(|_| connection_error("SQLite worker exited while opening"))??;
        Ok(Self { sender, name })
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    fn send_message(&self, message: WorkerMessage) -> Result<(), SqlLeaseError> {
        self.sender
            .send(message)
            .map_err(|_| connection_error("SQLite worker closed"))
    }

    /// Hand a batch to the worker. The batch is queued behind every batch sent
    /// before it; the receiver resolves once it has run.
    pub(crate) fn submit(
        &self,
        commands: Vec<Command>,
    ) -> Result<oneshot::Receiver<Vec<Response>>, SqlLeaseError> {
        let (tx, rx) = oneshot::channel();
        self.send_message(WorkerMessage::Batch {
            commands,
            respond_to: tx,
        })?;
        Ok(rx)
    }

    /// Close the connection; the worker exits if that succeeds.
    pub(crate) async fn close(&self) -> Result<(), SqlLeaseError> {
        let (tx, rx) = oneshot::channel();
        self.send_message(WorkerMessage::Close { respond_to: tx })?;
        rx.await
            .map_err(|_| connection_error("SQLite worker dropped while closing"))?
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }
}

pub(crate) fn connection_error(message: &str) -> SqlLeaseError {
    SqlLeaseError::ConnectionError(message.into())
}
