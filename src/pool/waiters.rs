use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::SqlLeaseError;

use super::Slot;
use super::lease::PoolCore;

pub(crate) type Delivery<H> = Result<Slot<H>, SqlLeaseError>;

struct Waiter<H> {
    id: u64,
    tx: oneshot::Sender<Delivery<H>>,
}

/// FIFO queue of pending reservations.
pub(crate) struct WaitQueue<H> {
    next_id: u64,
    entries: VecDeque<Waiter<H>>,
}

impl<H> WaitQueue<H> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self) -> (u64, oneshot::Receiver<Delivery<H>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push_back(Waiter { id, tx });
        (id, rx)
    }

    /// Remove waiter `id`. Returns false when it was already served.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|waiter| waiter.id == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Give `slot` to the oldest live waiter; returns it when nobody took it.
    pub(crate) fn hand_off(&mut self, slot: Slot<H>) -> Option<Slot<H>> {
        let mut slot = slot;
        while let Some(waiter) = self.entries.pop_front() {
            match waiter.tx.send(Ok(slot)) {
                Ok(()) => return None,
                Err(Ok(returned)) => slot = returned,
                Err(Err(_)) => return None,
            }
        }
        Some(slot)
    }

    pub(crate) fn fail_all(&mut self, make_error: impl Fn() -> SqlLeaseError) {
        for waiter in self.entries.drain(..) {
            let _ = waiter.tx.send(Err(make_error()));
        }
    }

    pub(crate) fn has_live(&self) -> bool {
        self.entries.iter().any(|waiter| !waiter.tx.is_closed())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A queued reservation. Dropping it before it resolves (including by
/// cancellation) removes the waiter, and passes on a handle that was already
/// delivered to it.
pub(crate) struct WaitGuard<H: Send + 'static> {
    core: Arc<dyn PoolCore<H>>,
    id: u64,
    rx: oneshot::Receiver<Delivery<H>>,
    settled: bool,
}

impl<H: Send + 'static> WaitGuard<H> {
    pub(crate) fn new(
        core: Arc<dyn PoolCore<H>>,
        id: u64,
        rx: oneshot::Receiver<Delivery<H>>,
    ) -> Self {
        Self {
            core,
            id,
            rx,
            settled: false,
        }
    }

    pub(crate) async fn wait(mut self, cancel: Option<CancellationToken>) -> Delivery<H> {
        let received = match cancel {
            Some(token) => tokio::select! {
                biased;
                received = &mut self.rx => Some(received),
                () = token.cancelled() => None,
            },
            None => Some((&mut self.rx).await),
        };
        match received {
            Some(Ok(delivery)) => {
                self.settled = true;
                delivery
            }
            Some(Err(_)) => {
                self.settled = true;
                Err(SqlLeaseError::ConnectionError(
                    "pool dropped a queued reservation".into(),
                ))
            }
            None => Err(SqlLeaseError::Cancelled),
        }
    }
}

impl<H: Send + 'static> Drop for WaitGuard<H> {
    fn drop(&mut self) {
        if self.settled || self.core.forget_waiter(self.id) {
            return;
        }
        // Served while we were leaving; hand the slot to the next in line.
        if let Ok(Ok(slot)) = self.rx.try_recv() {
            Arc::clone(&self.core).reclaim(slot, false);
        }
    }
}
