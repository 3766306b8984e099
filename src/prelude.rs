//! Convenient imports for common functionality.

pub use crate::capability::{Engine, JournalMode, OpenOptions, PrepareOptions};
pub use crate::config::{DatabaseOptions, DatabaseOptionsBuilder};
pub use crate::connection::{Connection, PreparedQuery, RowStream};
pub use crate::database::{Database, PoolStatement};
pub use crate::error::SqlLeaseError;
pub use crate::pipeline::Pipeline;
pub use crate::pool::{PoolStatus, ReserveOptions};
pub use crate::transaction::{
    BeginTransaction, Transaction, TransactionKind, TransactionOptions, TransactionState, TxFuture,
};
pub use crate::types::{Params, ResultSet, Row, RunResult, Value};
