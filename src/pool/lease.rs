use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::Slot;

/// What a lease needs from the pool it came from.
pub(crate) trait PoolCore<H>: Send + Sync {
    /// Take a handle back. `broken` handles are closed instead of recycled.
    fn reclaim(self: Arc<Self>, slot: Slot<H>, broken: bool);

    /// Drop a queued waiter; false when it was already served.
    fn forget_waiter(&self, id: u64) -> bool;
}

/// Exclusive right to use one handle until released.
///
/// Dropping the lease releases it; [`Lease::release`] is the explicit form.
pub struct Lease<H: Send + 'static> {
    slot: Option<Slot<H>>,
    home: Arc<dyn PoolCore<H>>,
    broken: bool,
}

impl<H: Send + 'static> Lease<H> {
    pub(crate) fn new(slot: Slot<H>, home: Arc<dyn PoolCore<H>>) -> Self {
        Self {
            slot: Some(slot),
            home,
            broken: false,
        }
    }

    /// Pool-unique name of the leased handle (`writer`, `connection-3`, ...).
    #[must_use]
    pub fn name(&self) -> &str {
        self.slot.as_ref().map_or("", |slot| &slot.name)
    }

    /// Close the handle on release instead of recycling it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the handle to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<H: Send + 'static> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        match self.slot.as_ref() {
            Some(slot) => &slot.handle,
            // only emptied in drop
            None => unreachable!("lease used after release"),
        }
    }
}

impl<H: Send + 'static> Drop for Lease<H> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            Arc::clone(&self.home).reclaim(slot, self.broken);
        }
    }
}

impl<H: Send + 'static> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.name())
            .field("broken", &self.broken)
            .finish()
    }
}
