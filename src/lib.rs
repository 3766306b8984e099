//! Leased, batched access to SQLite from async code.
//!
//! A SQLite connection runs one operation at a time. This crate puts every
//! physical connection on its own worker thread, hands connections out
//! through a lease pool (one writer, a bounded set of readers), and moves
//! statement work to the workers as ordered command batches.
//!
//! ```no_run
//! use sqlite_lease::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlLeaseError> {
//! let db = Database::builder("app.db").max_connections(4).build().await?;
//! db.run("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT)", &Params::none())
//!     .await?;
//!
//! db.transaction(TransactionOptions::default(), |tx| {
//!     Box::pin(async move {
//!         tx.run("INSERT INTO kv VALUES (?1, ?2)", &Params::positional(["a", "1"]))
//!             .await?;
//!         Ok(())
//!     })
//! })
//! .await?;
//!
//! let rows = db.select("SELECT v FROM kv WHERE k = ?1", &Params::positional(["a"])).await?;
//! assert_eq!(rows.len(), 1);
//! db.close().await
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod handle;
pub mod pipeline;
pub mod pool;
pub mod prelude;
pub mod sqlite;
pub mod transaction;
pub mod types;
pub mod worker;

pub use config::{DatabaseOptions, DatabaseOptionsBuilder};
pub use connection::{Connection, PreparedQuery, RowStream};
pub use database::{Database, PoolStatement};
pub use error::{SqlLeaseError, WireError};
pub use pipeline::Pipeline;
pub use transaction::{
    BeginTransaction, Transaction, TransactionKind, TransactionOptions, TransactionState,
};
pub use types::{Params, ResultSet, Row, RunResult, StepResult, Value};
