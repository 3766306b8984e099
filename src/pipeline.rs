use std::fmt;

use crate::connection::{Connection, PreparedQuery};
use crate::error::SqlLeaseError;
use crate::types::Params;
use crate::worker::{Ticket, settle_all};

/// Runs queued without waiting for each one.
///
/// Work goes out in the order it is queued, so the order of `run` calls is the
/// order the engine sees. Choosing when to `flush` is up to the caller.
pub struct Pipeline<'c> {
    conn: &'c Connection,
    tickets: Vec<Ticket>,
    queued: usize,
}

impl<'c> Pipeline<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            tickets: Vec::new(),
            queued: 0,
        }
    }

    /// Queue `stmt` with `params`.
    ///
    /// # Errors
    /// [`SqlLeaseError::ProtocolViolation`] when `stmt` belongs to another
    /// connection.
    pub fn run(&mut self, stmt: &PreparedQuery<'_>, params: &Params) -> Result<(), SqlLeaseError> {
        if !std::ptr::eq(stmt.connection(), self.conn) {
            return Err(SqlLeaseError::protocol(format!(
                "statement prepared on {} cannot run in a pipeline on {}",
                stmt.connection().name(),
                self.conn.name()
            )));
        }
        self.tickets.extend(stmt.enqueue_run(params));
        self.queued += 1;
        Ok(())
    }

    /// Queue ad-hoc SQL through the handle's statement cache.
    ///
    /// # Errors
    /// Statement id exhaustion.
    pub fn run_sql(&mut self, sql: &str, params: &Params) -> Result<(), SqlLeaseError> {
        self.tickets
            .extend(self.conn.handle().queue_cached_run(sql, params)?);
        self.queued += 1;
        Ok(())
    }

    /// Runs queued since the last flush.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Wait until everything queued has run.
    ///
    /// # Errors
    /// The first failure among the queued runs; later runs still executed.
    pub async fn flush(&mut self) -> Result<(), SqlLeaseError> {
        self.queued = 0;
        let tickets = std::mem::take(&mut self.tickets);
        settle_all(tickets).await.map(|_| ())
    }
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("connection", &self.conn.name())
            .field("queued", &self.queued)
            .finish()
    }
}
