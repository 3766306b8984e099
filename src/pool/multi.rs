use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::SqlLeaseError;

use super::lease::{Lease, PoolCore};
use super::waiters::{WaitGuard, WaitQueue};
use super::{ManageHandle, PoolStatus, ReserveOptions, Slot, close_detached, lock, spawn_detached};

/// Up to `max_connections` interchangeable handles, opened on demand.
///
/// Handles are named `connection-{n}` from a counter that never goes back, so
/// a replacement for an evicted handle gets a fresh name.
pub struct MultiPool<M: ManageHandle> {
    core: Arc<MultiCore<M>>,
}

impl<M: ManageHandle> Clone for MultiPool<M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct MultiCore<M: ManageHandle> {
    manager: Arc<M>,
    max_connections: usize,
    state: Mutex<MultiState<M::Handle>>,
    /// Signalled whenever a handle returns or `opened` drops.
    returned: Notify,
}

struct MultiState<H> {
    idle: Vec<Slot<H>>,
    /// Open plus currently opening.
    opened: usize,
    next_index: usize,
    waiters: WaitQueue<H>,
    closed: bool,
}

impl<H> MultiState<H> {
    fn claim_name(&mut self) -> Arc<str> {
        let name = format!("connection-{}", self.next_index);
        self.next_index += 1;
        self.opened += 1;
        Arc::from(name)
    }
}

impl<M: ManageHandle> MultiCore<M> {
    /// Give back one unit of capacity and wake a draining `close`.
    fn release_capacity(&self, state: &mut MultiState<M::Handle>) {
        state.opened = state.opened.saturating_sub(1);
        self.returned.notify_waiters();
    }
}

/// Gives the capacity slot back if an open is abandoned or fails.
struct OpeningGuard<'a, M: ManageHandle> {
    core: &'a MultiCore<M>,
    armed: bool,
}

impl<M: ManageHandle> OpeningGuard<'_, M> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: ManageHandle> Drop for OpeningGuard<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = lock(&self.core.state);
            self.core.release_capacity(&mut state);
        }
    }
}

impl<M: ManageHandle> MultiPool<M> {
    /// Build an empty pool. No handle is opened until the first `reserve`.
    ///
    /// # Errors
    /// [`SqlLeaseError::ConfigError`] when `max_connections` is zero.
    pub fn new(manager: Arc<M>, max_connections: usize) -> Result<Self, SqlLeaseError> {
        if max_connections == 0 {
            return Err(SqlLeaseError::ConfigError(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(Self {
            core: Arc::new(MultiCore {
                manager,
                max_connections,
                state: Mutex::new(MultiState {
                    idle: Vec::new(),
                    opened: 0,
                    next_index: 0,
                    waiters: WaitQueue::new(),
                    closed: false,
                }),
                returned: Notify::new(),
            }),
        })
    }

    /// Lease a free handle, open a new one below the cap, or queue.
    ///
    /// A failed open is returned to the caller when the pool has no other
    /// handle that could serve it; otherwise the request stays queued.
    ///
    /// # Errors
    /// [`SqlLeaseError::Cancelled`], [`SqlLeaseError::PoolClosed`], or the
    /// manager's open error as described above.
    pub async fn reserve(
        &self,
        options: &ReserveOptions,
    ) -> Result<Lease<M::Handle>, SqlLeaseError> {
        let name = {
            let mut state = lock(&self.core.state);
            if state.closed {
                return Err(SqlLeaseError::PoolClosed);
            }
            if let Some(slot) = state.idle.pop() {
                return Ok(Lease::new(slot, self.home()));
            }
            if state.opened < self.core.max_connections {
                Some(state.claim_name())
            } else {
                None
            }
        };

        let waiter = match name {
            Some(name) => match self.expand(name).await? {
                Expansion::Opened(slot) => return Ok(Lease::new(slot, self.home())),
                Expansion::Queued(waiter) => waiter,
            },
            None => {
                let mut state = lock(&self.core.state);
                if let Some(slot) = state.idle.pop() {
                    return Ok(Lease::new(slot, self.home()));
                }
                state.waiters.push()
            }
        };
        let (id, rx) = waiter;
        let slot = WaitGuard::new(self.home(), id, rx)
            .wait(options.cancel.clone())
            .await?;
        Ok(Lease::new(slot, self.home()))
    }

    async fn expand(&self, name: Arc<str>) -> Result<Expansion<M::Handle>, SqlLeaseError> {
        let guard = OpeningGuard {
            core: &self.core,
            armed: true,
        };
        match self.core.manager.open(&name).await {
            Ok(handle) => {
                guard.disarm();
                tracing::debug!(handle = %name, "opened pool handle");
                let slot = Slot { name, handle };
                let closed = lock(&self.core.state).closed;
                if closed {
                    Arc::clone(&self.core).reclaim(slot, false);
                    return Err(SqlLeaseError::PoolClosed);
                }
                Ok(Expansion::Opened(slot))
            }
            Err(err) => {
                drop(guard);
                let mut state = lock(&self.core.state);
                if state.closed {
                    return Err(SqlLeaseError::PoolClosed);
                }
                if let Some(slot) = state.idle.pop() {
                    return Ok(Expansion::Opened(slot));
                }
                if state.opened == 0 {
                    return Err(err);
                }
                tracing::warn!(
                    handle = %name,
                    error = %err,
                    "pool expansion failed; request stays queued"
                );
                Ok(Expansion::Queued(state.waiters.push()))
            }
        }
    }

    /// Close the pool. Idle handles are closed right away; leased ones and
    /// ones still opening are waited for and closed as they come back.
    ///
    /// # Errors
    /// [`SqlLeaseError::CloseFailed`] listing every handle that failed.
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

            let (idle, outstanding) = {
                let mut state = lock(&self.core.state);
                let idle = std::mem::take(&mut state.idle);
                (idle, state.opened)
            };
            if idle.is_empty() {
                if outstanding == 0 {
                    break;
                }
                tracing::debug!(outstanding, "close waiting for leased handles");
                returned.await;
                continue;
            }
            for slot in idle {
                if let Err(err) = self.core.manager.close(slot.handle).await {
                    failures.push(format!("{}: {err}", slot.name));
                } else {
                    tracing::debug!(handle = %slot.name, "closed pool handle");
                }
                let mut state = lock(&self.core.state);
                state.opened = state.opened.saturating_sub(1);
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
            opened: state.opened,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.core.max_connections
    }

    fn home(&self) -> Arc<dyn PoolCore<M::Handle>> {
        Arc::clone(&self.core) as Arc<dyn PoolCore<M::Handle>>
    }
}

enum Expansion<H> {
    Opened(Slot<H>),
    Queued((u64, tokio::sync::oneshot::Receiver<super::waiters::Delivery<H>>)),
}

impl<M: ManageHandle> MultiCore<M> {
    /// One attempt to open a handle for the oldest waiter.
    fn pump(self: Arc<Self>) {
        let name = {
            let mut state = lock(&self.state);
            if state.closed
                || !state.idle.is_empty()
                || state.opened >= self.max_connections
                || !state.waiters.has_live()
            {
                return;
            }
            state.claim_name()
        };
        let core = Arc::clone(&self);
        let spawned = spawn_detached(async move {
            match core.manager.open(&name).await {
                Ok(handle) => {
                    tracing::debug!(handle = %name, "opened pool handle for queued request");
                    Arc::clone(&core).reclaim(Slot { name, handle }, false);
                }
                Err(err) => {
                    let mut state = lock(&core.state);
                    core.release_capacity(&mut state);
                    if state.opened == 0 {
                        let message = err.to_string();
                        state.waiters.fail_all(|| SqlLeaseError::ConnectionError(message.clone()));
                    } else {
                        tracing::warn!(
                            handle = %name,
                            error = %err,
                            "pool expansion failed; requests stay queued"
                        );
                    }
                }
            }
        });
        if !spawned {
            let mut state = lock(&self.state);
            self.release_capacity(&mut state);
        }
    }
}

impl<M: ManageHandle> PoolCore<M::Handle> for MultiCore<M> {
    fn reclaim(self: Arc<Self>, slot: Slot<M::Handle>, broken: bool) {
        let mut state = lock(&self.state);
        if state.closed {
            // close() is waiting for it, broken or not
            state.idle.push(slot);
            drop(state);
            self.returned.notify_waiters();
            return;
        }
        if broken {
            tracing::warn!(handle = %slot.name, "evicting broken handle");
            self.release_capacity(&mut state);
            drop(state);
            close_detached(Arc::clone(&self.manager), slot);
            self.pump();
            return;
        }
        if let Some(slot) = state.waiters.hand_off(slot) {
            state.idle.push(slot);
        }
        drop(state);
        self.pump();
    }

    fn forget_waiter(&self, id: u64) -> bool {
        lock(&self.state).waiters.remove(id)
    }
}

impl<M: ManageHandle> fmt::Debug for MultiPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiPool")
            .field("max_connections", &self.core.max_connections)
            .field("status", &self.status())
            .finish()
    }
}
