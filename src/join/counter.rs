//! Run counter of a join.
//!
//! Observable count of live producers. The outer driver counts as one unit
//! for its whole lifetime, so the counter starts at 1 and a join with a
//! momentarily-empty set of inner runners cannot shut down early. Each inner
//! runner adds its unit before it is spawned and removes it exactly once
//! when it finishes or fails.
//!
//! Like the termination signal, the cell is a [`tokio::sync::watch`]:
//! updates are serialized under the cell's lock, which is what makes the
//! zero detection in [`decrement`](RunCounter::decrement) race-free: two
//! concurrent final decrements can never both observe themselves as last.

use tokio::sync::watch;

pub(crate) struct RunCounter {
    cell: watch::Sender<usize>,
}

impl RunCounter {
    /// Starts at 1: the outer driver's own unit.
    pub(crate) fn new() -> Self {
        Self {
            cell: watch::Sender::new(1),
        }
    }

    pub(crate) fn increment(&self) {
        self.cell.send_modify(|n| *n += 1);
    }

    /// Removes one unit; returns true for exactly the caller whose decrement
    /// reached zero. That caller owns the final shutdown.
    pub(crate) fn decrement(&self) -> bool {
        let mut last = false;
        self.cell.send_modify(|n| {
            debug_assert!(*n > 0, "run counter underflow");
            *n -= 1;
            last = *n == 0;
        });
        last
    }

    pub(crate) fn get(&self) -> usize {
        *self.cell.borrow()
    }

    /// Resolves once the count reaches zero.
    pub(crate) async fn quiesced(&self) {
        let mut rx = self.cell.subscribe();
        // Cannot fail: `self` keeps the sender alive across the await
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
