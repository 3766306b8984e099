//! Wire shapes for the command transport.
//!
//! A batch is a `Vec<Command>`; the reply is a `Vec<Response>` of the same
//! length and order. Both are plain serde types so a transport that crosses a
//! process boundary can ship them as JSON via [`encode_batch`] and friends.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::capability::PrepareOptions;
use crate::error::{SqlLeaseError, WireError};
use crate::types::{Params, RunResult, StepResult};

use super::ids::StatementId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    Prepare {
        id: StatementId,
        sql: String,
        #[serde(default)]
        options: PrepareOptions,
    },
    Bind {
        id: StatementId,
        params: Params,
    },
    Step {
        id: StatementId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Run {
        id: StatementId,
    },
    Reset {
        id: StatementId,
        #[serde(default, rename = "clearBindings")]
        clear_bindings: bool,
    },
    Finalize {
        id: StatementId,
    },
    /// Column names of a prepared statement.
    Parse {
        id: StatementId,
    },
    /// No-op round trip.
    Sync,
    /// Change count and last rowid of the most recent write.
    GetChanges,
}

impl Command {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Prepare { .. } => "prepare",
            Command::Bind { .. } => "bind",
            Command::Step { .. } => "step",
            Command::Run { .. } => "run",
            Command::Reset { .. } => "reset",
            Command::Finalize { .. } => "finalize",
            Command::Parse { .. } => "parse",
            Command::Sync => "sync",
            Command::GetChanges => "getChanges",
        }
    }
}

/// Success value of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Unit,
    Step(StepResult),
    Run(RunResult),
    Columns(Vec<String>),
}

impl Reply {
    pub(crate) fn into_step(self) -> Result<StepResult, SqlLeaseError> {
        match self {
            Reply::Step(step) => Ok(step),
            other => Err(unexpected("step", &other)),
        }
    }

    pub(crate) fn into_run(self) -> Result<RunResult, SqlLeaseError> {
        match self {
            Reply::Run(run) => Ok(run),
            other => Err(unexpected("run", &other)),
        }
    }

    pub(crate) fn into_columns(self) -> Result<Vec<String>, SqlLeaseError> {
        match self {
            Reply::Columns(columns) => Ok(columns),
            other => Err(unexpected("columns", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> SqlLeaseError {
    SqlLeaseError::protocol(format!("expected a {wanted} reply, got {got:?}"))
}

/// `{value}` or `{error: {code, message, stack}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error { error: WireError },
    Value { value: Reply },
}

impl Response {
    pub(crate) fn from_result(result: Result<Reply, SqlLeaseError>) -> Self {
        match result {
            Ok(value) => Response::Value { value },
            Err(err) => Response::Error {
                error: err.to_wire(),
            },
        }
    }

    /// # Errors
    /// The carried error, mapped back onto the error taxonomy.
    pub fn into_result(self) -> Result<Reply, SqlLeaseError> {
        match self {
            Response::Value { value } => Ok(value),
            Response::Error { error } => Err(SqlLeaseError::from(error)),
        }
    }
}

/// Messages understood by a worker thread.
pub(super) enum WorkerMessage {
    Batch {
        commands: Vec<Command>,
        respond_to: oneshot::Sender<Vec<Response>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<(), SqlLeaseError>>,
    },
    Shutdown,
}

/// # Errors
/// [`SqlLeaseError::ProtocolViolation`] if serialization fails.
pub fn encode_batch(commands: &[Command]) -> Result<String, SqlLeaseError> {
    serde_json::to_string(commands).map_err(|err| codec_error("batch", &err))
}

/// # Errors
/// [`SqlLeaseError::ProtocolViolation`] for malformed input.
pub fn decode_batch(text: &str) -> Result<Vec<Command>, SqlLeaseError> {
    serde_json::from_str(text).map_err(|err| codec_error("batch", &err))
}

/// # Errors
/// [`SqlLeaseError::ProtocolViolation`] if serialization fails.
pub fn encode_responses(responses: &[Response]) -> Result<String, SqlLeaseError> {
    serde_json::to_string(responses).map_err(|err| codec_error("responses", &err))
}

/// # Errors
/// [`SqlLeaseError::ProtocolViolation`] for malformed input.
pub fn decode_responses(text: &str) -> Result<Vec<Response>, SqlLeaseError> {
    serde_json::from_str(text).map_err(|err| codec_error("responses", &err))
}

fn codec_error(what: &str, err: &serde_json::Error) -> SqlLeaseError {
    SqlLeaseError::protocol(format!("malformed {what}: {err}"))
}
