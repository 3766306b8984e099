use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::capability::{Engine, OpenOptions, PrepareOptions};
use crate::error::SqlLeaseError;
use crate::pool::{ManageHandle, lock};
use crate::types::{Params, ResultSet, RunResult};
use crate::worker::{
    Command, CommandClient, Reply, StatementId, Ticket, WorkerHandle, settle_all,
};

/// Persisted statements kept per handle unless configured otherwise.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

/// One physical connection as the pools see it: a worker thread, the client
/// that feeds it, and the handle's persisted statements.
///
/// The statement cache is least-recently-used; an evicted statement is
/// finalized on the worker and its id returned to the allocator.
pub struct SqliteHandle {
    client: CommandClient,
    cache: Mutex<IndexMap<String, StatementId>>,
    capacity: usize,
}

impl SqliteHandle {
    pub(crate) fn new(client: CommandClient, capacity: usize) -> Self {
        Self {
            client,
            cache: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.client.name()
    }

    #[must_use]
    pub fn client(&self) -> &CommandClient {
        &self.client
    }

    /// Queue commands against the persisted statement for `sql`, preparing it
    /// first if it is not cached.
    ///
    /// The cache lock is held while `queue` runs, so an eviction can never
    /// finalize (and recycle) an id between lookup and enqueue.
    pub(crate) fn with_cached<T>(
        &self,
        sql: &str,
        queue: impl FnOnce(StatementId) -> T,
    ) -> Result<T, SqlLeaseError> {
        let mut cache = lock(&self.cache);
        if let Some(index) = cache.get_index_of(sql) {
            let last = cache.len() - 1;
            cache.move_index(index, last);
            return Ok(queue(cache[last]));
        }
        while cache.len() >= self.capacity {
            let Some((evicted_sql, evicted)) = cache.shift_remove_index(0) else {
                break;
            };
            tracing::trace!(handle = %self.name(), sql = %evicted_sql, "statement evicted");
            self.client.finalize(evicted);
        }
        let id = self.client.allocate_id()?;
        self.client.send(Command::Prepare {
            id,
            sql: sql.to_string(),
            options: PrepareOptions::persisted(),
        });
        cache.insert(sql.to_string(), id);
        Ok(queue(id))
    }

    #[must_use]
    pub fn cached_statements(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Queue bind and run of a cached statement; the run ticket comes last.
    fn queue_run(&self, id: StatementId, params: &Params) -> Vec<Ticket> {
        let mut tickets = vec![self.client.enqueue(Command::Reset {
            id,
            clear_bindings: true,
        })];
        if !params.is_empty() {
            tickets.push(self.client.enqueue(Command::Bind {
                id,
                params: params.clone(),
            }));
        }
        tickets.push(self.client.enqueue(Command::Run { id }));
        tickets
    }

    /// Run `sql` through the handle's statement cache.
    pub(crate) async fn run_cached(
        &self,
        sql: &str,
        params: &Params,
    ) -> Result<RunResult, SqlLeaseError> {
        let mut replies = settle_all(self.queue_cached_run(sql, params)?).await?;
        match replies.pop() {
            Some(reply) => reply.into_run(),
            None => Err(SqlLeaseError::protocol("run produced no reply")),
        }
    }

    pub(crate) fn queue_cached_run(
        &self,
        sql: &str,
        params: &Params,
    ) -> Result<Vec<Ticket>, SqlLeaseError> {
        self.with_cached(sql, |id| self.queue_run(id, params))
    }

    /// Queue a cached run without waiting; failures surface at the next sync.
    pub(crate) fn run_cached_detached(&self, sql: &str) -> Result<(), SqlLeaseError> {
        drop(self.queue_cached_run(sql, &Params::none())?);
        Ok(())
    }

    /// Select through the handle's statement cache.
    ///
    /// Column names come from the step itself, so they always match the rows
    /// even after a schema change.
    pub(crate) async fn select_cached(
        &self,
        sql: &str,
        params: &Params,
    ) -> Result<ResultSet, SqlLeaseError> {
        let tickets = self.with_cached(sql, |id| {
            let mut tickets = vec![self.client.enqueue(Command::Reset {
                id,
                clear_bindings: true,
            })];
            if !params.is_empty() {
                tickets.push(self.client.enqueue(Command::Bind {
                    id,
                    params: params.clone(),
                }));
            }
            tickets.push(self.client.enqueue(Command::Step { id, count: None }));
            tickets.push(self.client.enqueue(Command::Reset {
                id,
                clear_bindings: false,
            }));
            tickets
        })?;
        let step_at = tickets.len() - 2;

        let mut replies = settle_all(tickets).await?;
        let step = take_reply(&mut replies, step_at).into_step()?;
        Ok(ResultSet::from_raw(Arc::new(step.columns), step.rows))
    }
}

pub(crate) fn take_reply(replies: &mut [Reply], at: usize) -> Reply {
    replies
        .get_mut(at)
        .map_or(Reply::Unit, |reply| std::mem::replace(reply, Reply::Unit))
}

impl fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("name", &self.name())
            .field("cached_statements", &self.cached_statements())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Opens [`SqliteHandle`]s on worker threads for a pool.
pub(crate) struct SqliteManager {
    engine: Arc<dyn Engine>,
    options: OpenOptions,
    max_in_flight: usize,
    statement_cache_capacity: usize,
}

impl SqliteManager {
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        options: OpenOptions,
        max_in_flight: usize,
        statement_cache_capacity: usize,
    ) -> Self {
        Self {
            engine,
            options,
            max_in_flight,
            statement_cache_capacity,
        }
    }
}

#[async_trait]
impl ManageHandle for SqliteManager {
    type Handle = SqliteHandle;

    async fn open(&self, name: &str) -> Result<SqliteHandle, SqlLeaseError> {
        let worker =
            WorkerHandle::spawn(Arc::clone(&self.engine), self.options.clone(), Arc::from(name))
                .await?;
        Ok(SqliteHandle::new(
            CommandClient::start(worker, self.max_in_flight),
            self.statement_cache_capacity,
        ))
    }

    async fn close(&self, handle: SqliteHandle) -> Result<(), SqlLeaseError> {
        handle.client.close().await
    }
}
