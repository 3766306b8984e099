//! Cross-thread command transport.
//!
//! Each physical connection lives on its own `sqlite-worker-*` thread behind a
//! [`BatchExecutor`]. Callers talk to it through a [`CommandClient`], which
//! buffers commands and ships them as batches, correlating every response
//! back to the command that produced it.

mod channel;
mod client;
mod dispatcher;
mod ids;
mod manager;

pub use channel::{
    Command, Reply, Response, decode_batch, decode_responses, encode_batch, encode_responses,
};
pub use client::{CommandClient, DEFAULT_MAX_IN_FLIGHT, Ticket, settle_all};
pub use dispatcher::BatchExecutor;
pub use ids::{MAX_LIVE_STATEMENTS, StatementId, StatementIds};
pub(crate) use manager::WorkerHandle;
