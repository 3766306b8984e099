//! Connection lease manager.
//!
//! A physical handle can run one operation at a time, so every handle is
//! owned by at most one [`Lease`]. Three pools arbitrate the leases:
//!
//! - [`SinglePool`]: one handle and a FIFO wait queue (the writer)
//! - [`MultiPool`]: up to `max_connections` interchangeable handles, opened lazily
//! - [`ReadWritePool`]: one of each, routed by [`ReserveOptions::readonly`]

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SqlLeaseError;

mod lease;
mod multi;
mod read_write;
mod single;
mod waiters;

pub use lease::Lease;
pub use multi::MultiPool;
pub use read_write::ReadWritePool;
pub use single::SinglePool;

/// Opens and closes the handles a pool hands out.
#[async_trait]
pub trait ManageHandle: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Open a new handle. `name` is unique within the pool.
    async fn open(&self, name: &str) -> Result<Self::Handle, SqlLeaseError>;

    /// Close a handle that will never be handed out again.
    async fn close(&self, handle: Self::Handle) -> Result<(), SqlLeaseError>;
}

/// Options for one `reserve` call.
#[derive(Debug, Clone, Default)]
pub struct ReserveOptions {
    /// `Some(true)` routes to the reader pool; anything else to the writer.
    pub readonly: Option<bool>,
    /// Cancels the wait (not a lease that was already granted).
    pub cancel: Option<CancellationToken>,
}

impl ReserveOptions {
    #[must_use]
    pub fn reader() -> Self {
        Self {
            readonly: Some(true),
            cancel: None,
        }
    }

    #[must_use]
    pub fn writer() -> Self {
        Self {
            readonly: Some(false),
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.readonly.unwrap_or(false)
    }
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Handles currently open (idle or leased), including ones being opened.
    pub opened: usize,
    pub idle: usize,
    pub waiting: usize,
}

/// A handle together with its pool-unique name.
pub(crate) struct Slot<H> {
    pub(crate) name: std::sync::Arc<str>,
    pub(crate) handle: H,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `fut` on the ambient tokio runtime, if there is one.
pub(crate) fn spawn_detached<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => false,
    }
}

/// Close a handle nobody is waiting on; failures can only be logged.
pub(crate) fn close_detached<M: ManageHandle>(
    manager: std::sync::Arc<M>,
    slot: Slot<M::Handle>,
) {
    let name = std::sync::Arc::clone(&slot.name);
    let spawned = spawn_detached(async move {
        if let Err(err) = manager.close(slot.handle).await {
            tracing::error!(handle = %slot.name, error = %err, "failed to close handle");
        } else {
            tracing::debug!(handle = %slot.name, "closed handle");
        }
    });
    if !spawned {
        tracing::debug!(handle = %name, "no runtime available; dropping handle without close");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::ManageHandle;
    use crate::error::SqlLeaseError;

    /// In-memory manager that counts opens and can be told to fail.
    #[derive(Default)]
    pub(crate) struct CountingManager {
        pub(crate) opened: AtomicUsize,
        pub(crate) closed: AtomicUsize,
        pub(crate) fail_open: AtomicBool,
        pub(crate) fail_close: AtomicBool,
    }

    #[derive(Debug)]
    pub(crate) struct FakeHandle {
        pub(crate) name: String,
    }

    #[async_trait]
    impl ManageHandle for CountingManager {
        type Handle = FakeHandle;

        async fn open(&self, name: &str) -> Result<FakeHandle, SqlLeaseError> {
            tokio::task::yield_now().await;
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(SqlLeaseError::ConnectionError(format!("cannot open {name}")));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeHandle {
                name: name.to_string(),
            })
        }

        async fn close(&self, handle: FakeHandle) -> Result<(), SqlLeaseError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(SqlLeaseError::ConnectionError(format!(
                    "{} refused to close",
                    handle.name
                )));
            }
            Ok(())
        }
    }

    pub(crate) fn manager() -> Arc<CountingManager> {
        Arc::new(CountingManager::default())
    }
}
