use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;

use crate::capability::{Connection, PrepareOptions, Statement};
use crate::error::{CODE_PANIC, SqlLeaseError, WireError};
use crate::types::{RunResult, Value};

use super::channel::{Command, Reply, Response, WorkerMessage};
use super::ids::StatementId;

const CHANGES_SQL: &str = "SELECT changes(), last_insert_rowid()";

/// Executes batches against one capability connection.
///
/// Lives on the connection's own execution context. Every command of a batch
/// runs and produces a response, whatever happened to the ones before it.
pub struct BatchExecutor {
    connection: Box<dyn Connection>,
    statements: HashMap<StatementId, Box<dyn Statement>>,
    changes: Option<Box<dyn Statement>>,
}

impl BatchExecutor {
    #[must_use]
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            statements: HashMap::new(),
            changes: None,
        }
    }

    /// Run `commands` in order; the result has one response per command.
    pub fn execute_batch(&mut self, commands: Vec<Command>) -> Vec<Response> {
        commands
            .into_iter()
            .map(|command| {
                let kind = command.kind();
                match panic::catch_unwind(AssertUnwindSafe(|| self.execute(command))) {
                    Ok(result) => Response::from_result(result),
                    Err(payload) => Response::Error {
                        error: WireError::new(
                            CODE_PANIC,
                            format!("{kind} panicked: {}", panic_message(payload.as_ref())),
                        ),
                    },
                }
            })
            .collect()
    }

    fn execute(&mut self, command: Command) -> Result<Reply, SqlLeaseError> {
        match command {
            Command::Prepare { id, sql, options } => {
                if self.statements.contains_key(&id) {
                    return Err(SqlLeaseError::protocol(format!(
                        "statement id {id} is already in use"
                    )));
                }
                let statement = self.connection.prepare(&sql, options)?;
                self.statements.insert(id, statement);
                Ok(Reply::Unit)
            }
            Command::Bind { id, params } => {
                self.statement(id)?.bind(&params)?;
                Ok(Reply::Unit)
            }
            Command::Step { id, count } => Ok(Reply::Step(self.statement(id)?.step(count)?)),
            Command::Run { id } => Ok(Reply::Run(self.statement(id)?.run()?)),
            Command::Reset { id, clear_bindings } => {
                self.statement(id)?.reset(clear_bindings)?;
                Ok(Reply::Unit)
            }
            Command::Finalize { id } => {
                // finalizing an unknown id is a no-op, like double-finalize
                if let Some(mut statement) = self.statements.remove(&id) {
                    statement.finalize()?;
                }
                Ok(Reply::Unit)
            }
            Command::Parse { id } => Ok(Reply::Columns(self.statement(id)?.columns()?)),
            Command::Sync => Ok(Reply::Unit),
            Command::GetChanges => Ok(Reply::Run(self.last_changes()?)),
        }
    }

    fn statement(&mut self, id: StatementId) -> Result<&mut Box<dyn Statement>, SqlLeaseError> {
        self.statements
            .get_mut(&id)
            .ok_or_else(|| SqlLeaseError::protocol(format!("no statement with id {id}")))
    }

    fn last_changes(&mut self) -> Result<RunResult, SqlLeaseError> {
        if self.changes.is_none() {
            self.changes = Some(
                self.connection
                    .prepare(CHANGES_SQL, PrepareOptions::persisted())?,
            );
        }
        let Some(stmt) = self.changes.as_mut() else {
            return Err(SqlLeaseError::protocol("changes statement unavailable"));
        };
        let step = stmt.step(None);
        stmt.reset(false)?;
        let row = step?.rows.into_iter().next().unwrap_or_default();
        let changes = row.first().and_then(Value::as_int).unwrap_or(0);
        let last_insert_row_id = row.get(1).and_then(Value::as_int).unwrap_or(0);
        Ok(RunResult {
            changes: u64::try_from(changes).unwrap_or(0),
            last_insert_row_id,
        })
    }

    /// Close the connection. On failure (a leaked statement) the connection and
    /// every statement stay usable.
    ///
    /// # Errors
    /// The connection's close error, typically [`SqlLeaseError::ResourceLeak`].
    pub fn close(&mut self) -> Result<(), SqlLeaseError> {
        self.connection.close()
    }

    #[must_use]
    pub fn live_statements(&self) -> usize {
        self.statements.len()
    }
}

/// Worker loop: serve messages until shutdown or a successful close.
pub(super) fn run_worker(mut executor: BatchExecutor, receiver: &Receiver<WorkerMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Batch {
                commands,
                respond_to,
            } => {
                let _ = respond_to.send(executor.execute_batch(commands));
            }
            WorkerMessage::Close { respond_to } => {
                let outcome = executor.close();
                let closed = outcome.is_ok();
                let _ = respond_to.send(outcome);
                if closed {
                    break;
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
