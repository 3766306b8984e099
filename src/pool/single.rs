use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::SqlLeaseError;

use super::lease::{Lease, PoolCore};
use super::waiters::{WaitGuard, WaitQueue};
use super::{ManageHandle, PoolStatus, ReserveOptions, Slot, close_detached, lock, spawn_detached};

/// One handle, one lease at a time, FIFO waiters.
pub struct SinglePool<M: ManageHandle> {
    core: Arc<SingleCore<M>>,
}

impl<M: ManageHandle> Clone for SinglePool<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct SingleCore<M: ManageHandle> {
    manager: Arc<M>,
    name: Arc<str>,
    state: Mutex<SingleState<M::Handle>>,
    /// Signalled when a closed pool gets its handle back or loses it.
    returned: Notify,
}

struct SingleState<H> {
    idle: Option<Slot<H>>,
    /// False once the handle was evicted and not yet reopened.
    present: bool,
    reopening: bool,
    waiters: WaitQueue<H>,
    closed: bool,
}

impl<M: ManageHandle> SinglePool<M> {
    /// Open the handle eagerly and build the pool around it.
    ///
    /// # Errors
    /// Returns the manager's error if the handle cannot be opened.
    pub async fn open(manager: Arc<M>, name: &str) -> Result<Self, SqlLeaseError> {
        let handle = manager.open(name).await?;
        tracing::debug!(handle = name, "opened single-pool handle");
        let name: Arc<str> = Arc::from(name);
        Ok(Self {
            core: Arc::new(SingleCore {
                manager,
                name: Arc::clone(&name),
                state: Mutex::new(SingleState {
                    idle: Some(Slot { name, handle }),
                    present: true,
                    reopening: false,
                    waiters: WaitQueue::new(),
                    closed: false,
                }),
                returned: Notify::new(),
            }),
        })
    }

    /// Lease the handle, waiting in FIFO order if it is in use.
    ///
    /// # Errors
    /// [`SqlLeaseError::Cancelled`] if `options.cancel` fires while queued,
    /// [`SqlLeaseError::PoolClosed`] if the pool is (or gets) closed.
    pub async fn reserve(
        &self,
        options: &ReserveOptions,
    ) -> Result<Lease<M::Handle>, SqlLeaseError> {
        let (id, rx, reopen) = {
            let mut state = lock(&self.core.state);
            if state.closed {
                return Err(SqlLeaseError::PoolClosed);
            }
            if let Some(slot) = state.idle.take() {
                return Ok(Lease::new(slot, self.home()));
            }
            let reopen = !state.present && !state.reopening;
            if reopen {
                state.reopening = true;
            }
            let (id, rx) = state.waiters.push();
            (id, rx, reopen)
        };
        if reopen {
            Arc::clone(&self.core).spawn_reopen();
        }
        let slot = WaitGuard::new(self.home(), id, rx)
            .wait(options.cancel.clone())
            .await?;
        Ok(Lease::new(slot, self.home()))
    }

    /// Close the pool, waiting for an outstanding lease to come back first.
    ///
    /// New reservations and queued waiters fail with
    /// [`SqlLeaseError::PoolClosed`] right away. A reopen still in progress is
    /// waited for as well.
    ///
    /// # Errors
    /// [`SqlLeaseError::CloseFailed`] if the handle refuses to close.
    pub async fn close(&self) -> Result<(), SqlLeaseError> {
        {
            let mut state = lock(&self.core.state);
            state.closed = true;
            state.waiters.fail_all(|| SqlLeaseError::PoolClosed);
        }
        let mut failures = Vec::new();
        loop {
            let returned = self.core.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            let (idle, finished) = {
                let mut state = lock(&self.core.state);
                let idle = state.idle.take();
                if idle.is_some() {
                    state.present = false;
                }
                (idle, !state.present && !state.reopening)
            };
            let Some(slot) = idle else {
                if finished {
                    break;
                }
                tracing::debug!(handle = %self.core.name, "close waiting for lease");
                returned.await;
                continue;
            };
            match self.core.manager.close(slot.handle).await {
                Ok(()) => tracing::debug!(handle = %slot.name, "closed single-pool handle"),
                Err(err) => failures.push(format!("{}: {err}", slot.name)),
            }
            if finished {
                break;
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SqlLeaseError::CloseFailed(failures))
        }
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = lock(&self.core.state);
        PoolStatus {
            opened: usize::from(state.present),
            idle: usize::from(state.idle.is_some()),
            waiting: state.waiters.len(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    fn home(&self) -> Arc<dyn PoolCore<M::Handle>> {
        Arc::clone(&self.core) as Arc<dyn PoolCore<M::Handle>>
    }
}

impl<M: ManageHandle> SingleCore<M> {
    fn spawn_reopen(self: Arc<Self>) {
        let core = Arc::clone(&self);
        let spawned = spawn_detached(async move {
            let opened = core.manager.open(&core.name).await;
            let mut state = lock(&core.state);
            state.reopening = false;
            match opened {
                Ok(handle) => {
                    tracing::debug!(handle = %core.name, "reopened single-pool handle");
                    state.present = true;
                    let slot = Slot {
                        name: Arc::clone(&core.name),
                        handle,
                    };
                    if state.closed {
                        state.idle = Some(slot);
                    } else if let Some(slot) = state.waiters.hand_off(slot) {
                        state.idle = Some(slot);
                    }
                }
                Err(err) => {
                    tracing::error!(handle = %core.name, error = %err, "failed to reopen handle");
                    let message = err.to_string();
                    state.waiters.fail_all(|| {
                        SqlLeaseError::ConnectionError(format!("handle unavailable: {message}"))
                    });
                }
            }
            drop(state);
            core.returned.notify_waiters();
        });
        if !spawned {
            lock(&self.state).reopening = false;
            self.returned.notify_waiters();
        }
    }
}

impl<M: ManageHandle> PoolCore<M::Handle> for SingleCore<M> {
    fn reclaim(self: Arc<Self>, slot: Slot<M::Handle>, broken: bool) {
        let mut state = lock(&self.state);
        if state.closed {
            // close() is waiting for it, broken or not
            state.idle = Some(slot);
            drop(state);
            self.returned.notify_waiters();
            return;
        }
        if broken {
            tracing::warn!(handle = %slot.name, "evicting broken handle");
            state.present = false;
            let waiting = state.waiters.has_live();
            if waiting {
                state.reopening = true;
            }
            drop(state);
            close_detached(Arc::clone(&self.manager), slot);
            if waiting {
                self.spawn_reopen();
            }
            return;
        }
        if let Some(slot) = state.waiters.hand_off(slot) {
            state.idle = Some(slot);
        }
    }

    fn forget_waiter(&self, id: u64) -> bool {
        lock(&self.state).waiters.remove(id)
    }
}

impl<M: ManageHandle> fmt::Debug for SinglePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinglePool")
            .field("name", &self.core.name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pool::testing::{CountingManager, manager};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_lease_outstanding() -> Result<(), SqlLeaseError> {
        let pool = SinglePool::open(manager(), "writer").await?;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let lease = pool.reserve(&ReserveOptions::default()).await?;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                lease.release();
                Ok::<(), SqlLeaseError>(())
            }));
        }
        for task in tasks {
            task.await.expect("task panicked")?;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().idle, 1);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waiters_are_served_in_order() -> Result<(), SqlLeaseError> {
        let pool = SinglePool::open(manager(), "writer").await?;
        let first = pool.reserve(&ReserveOptions::default()).await?;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let task_pool = pool.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = task_pool.reserve(&ReserveOptions::default()).await?;
                lock(&order).push(i);
                drop(lease);
                Ok::<(), SqlLeaseError>(())
            }));
            // let each task enqueue before spawning the next
            while pool.status().waiting < i + 1 {
                tokio::task::yield_now().await;
            }
        }
        drop(first);
        for task in tasks {
            task.await.expect("task panicked")?;
        }
        assert_eq!(*lock(&order), vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_only_affects_the_waiter() -> Result<(), SqlLeaseError> {
        let pool = SinglePool::open(manager(), "writer").await?;
        let held = pool.reserve(&ReserveOptions::default()).await?;

        let token = CancellationToken::new();
        let waiting = {
            let pool = pool.clone();
            let options = ReserveOptions::default().with_cancellation(token.clone());
            tokio::spawn(async move { pool.reserve(&options).await })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        let outcome = waiting.await.expect("task panicked");
        assert!(matches!(outcome, Err(SqlLeaseError::Cancelled)));
        assert_eq!(pool.status().waiting, 0);

        // the holder is unaffected and the handle comes back
        assert_eq!(held.name(), "writer");
        drop(held);
        let again = tokio::time::timeout(
            Duration::from_secs(1),
            pool.reserve(&ReserveOptions::default()),
        )
        .await
        .expect("handle returned")?;
        drop(again);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropped_wait_does_not_lose_the_handle() -> Result<(), SqlLeaseError> {
        let pool = SinglePool::open(manager(), "writer").await?;
        let held = pool.reserve(&ReserveOptions::default()).await?;
        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            pool.reserve(&ReserveOptions::default()),
        )
        .await;
        assert!(timed_out.is_err());
        drop(held);
        assert_eq!(pool.status().idle, 1);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_waits_for_the_lease_and_rejects_waiters() -> Result<(), SqlLeaseError> {
        let mgr: Arc<CountingManager> = manager();
        let pool = SinglePool::open(Arc::clone(&mgr), "writer").await?;
        let held = pool.reserve(&ReserveOptions::default()).await?;
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reserve(&ReserveOptions::default()).await })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }
        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        let outcome = waiting.await.expect("task panicked");
        assert!(matches!(outcome, Err(SqlLeaseError::PoolClosed)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished());
        assert_eq!(mgr.closed.load(Ordering::SeqCst), 0);

        drop(held);
        closing.await.expect("task panicked")?;
        assert_eq!(mgr.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().opened, 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_reports_failure_of_a_returned_lease() -> Result<(), SqlLeaseError> {
        let failing: Arc<CountingManager> = manager();
        failing.fail_close.store(true, Ordering::SeqCst);
        let pool = SinglePool::open(Arc::clone(&failing), "writer").await?;
        match pool.close().await {
            Err(SqlLeaseError::CloseFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("writer:"));
            }
            other => panic!("expected close failure, got {other:?}"),
        }

        let pool = SinglePool::open(Arc::clone(&failing), "writer").await?;
        let held = pool.reserve(&ReserveOptions::default()).await?;
        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        tokio::task::yield_now().await;
        drop(held);
        match closing.await.expect("task panicked") {
            Err(SqlLeaseError::CloseFailed(failures)) => {
                assert_eq!(failures, ["writer: Connection error: writer refused to close"]);
            }
            other => panic!("expected close failure, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn broken_handle_is_replaced() -> Result<(), SqlLeaseError> {
        let mgr: Arc<CountingManager> = manager();
        let pool = SinglePool::open(Arc::clone(&mgr), "writer").await?;
        let mut lease = pool.reserve(&ReserveOptions::default()).await?;
        lease.mark_broken();
        drop(lease);
        assert_eq!(pool.status().opened, 0);

        let lease = pool.reserve(&ReserveOptions::default()).await?;
        assert_eq!(lease.name(), "writer");
        assert_eq!(mgr.opened.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
