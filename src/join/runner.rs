//! Producer side of the join: the outer driver and the inner runners.
//!
//! The outer driver is the only task that pulls the outer stream. For every
//! inner stream it performs the admission sequence (lease, then permit, then
//! run-counter unit) and only then spawns the runner task.
//! Admission runs on the driver itself, which is never aborted (it is only
//! signal-interrupted at its own suspension points), so a runner can never
//! exist with half of its accounting in place; the one partial state, a
//! lease taken but no permit granted, is reversed in line when interruption
//! wins the admission race.
//!
//! Every runner that was admitted releases its lease, its permit and its
//! run-counter unit exactly once, whatever its inner stream does.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{
    Chunk, ChunkStream, OuterStream,
    counter::RunCounter,
    handoff,
    signal::StopSignal,
};
use crate::{
    error::Error,
    scope::{Lease, Scope},
};

/// Shared coordination state of one join, injected into every producer and
/// into the consumer-side stream. No globals.
pub(crate) struct JoinCore<T> {
    pub(crate) signal: StopSignal,
    pub(crate) runs: RunCounter,
    pub(crate) admission: Arc<Semaphore>,
    pub(crate) output: handoff::Sender<Chunk<T>>,
    pub(crate) scope: Scope,
}

impl<T> JoinCore<T> {
    pub(crate) fn new(scope: Scope, max_open: usize, output: handoff::Sender<Chunk<T>>) -> Self {
        Self {
            signal: StopSignal::new(),
            runs: RunCounter::new(),
            admission: Arc::new(Semaphore::new(max_open.min(Semaphore::MAX_PERMITS))),
            output,
            scope,
        }
    }

    /// Requests termination and delivers the end-of-stream sentinel.
    ///
    /// The signal transition happens-before the sentinel rendezvous, so a
    /// consumer that saw end-of-stream reads a stable terminal state.
    pub(crate) async fn stop(&self, err: Option<Error>) {
        self.signal.raise(err);
        self.output.close().await;
    }

    /// Consumer-drop path: request cancellation without suspending.
    ///
    /// No sentinel rendezvous is possible (the receiver is going away), so
    /// the hand-off is only marked closed; blocked senders are released by
    /// the signal transition instead.
    pub(crate) fn cancel_now(&self) {
        if self.signal.is_running() {
            self.signal.raise(Some(Error::Cancelled));
        }
        self.output.close_now();
    }

    /// Departure of one producer unit: routes its failure (if any) through
    /// the signal, then gives the unit back. The unit whose departure drains
    /// the counter to zero performs the final clean stop.
    pub(crate) async fn finish(&self, failure: Option<Error>) {
        if let Some(err) = failure {
            tracing::debug!(%err, "producer failed");
            self.stop(Some(err)).await;
        }
        if self.runs.decrement() {
            tracing::trace!("join quiescent");
            self.stop(None).await;
        }
    }
}

/// Consumes the outer stream and admits one runner per inner stream.
pub(crate) async fn drive_outer<T: Send + 'static>(
    core: Arc<JoinCore<T>>,
    mut outer: OuterStream<T>,
) {
    let failure = loop {
        let pulled = tokio::select! {
            biased;
            _ = core.signal.interrupted() => break None,
            pulled = outer.next() => pulled,
        };
        match pulled {
            None => break None,
            Some(Err(err)) => break Some(err),
            Some(Ok(inner)) => {
                if let Err(err) = admit(&core, inner).await {
                    break Some(err);
                }
            }
        }
    };
    drop(outer);
    core.finish(failure).await;
}

/// Admission sequence: lease, then permit, then counter unit, then spawn.
///
/// Backpressure lives here: with `max_open` runners holding permits, the
/// driver suspends on the semaphore and the outer stream is not pulled any
/// further.
async fn admit<T: Send + 'static>(
    core: &Arc<JoinCore<T>>,
    inner: ChunkStream<T>,
) -> Result<(), Error> {
    // A closed scope can no longer guarantee the resources the inner stream
    // runs under; admitting would be unsound, so the whole join fails
    let Some(lease) = core.scope.lease() else {
        return Err(Error::LeaseOnClosedScope);
    };

    let permit = tokio::select! {
        biased;
        _ = core.signal.interrupted() => {
            // Interrupted between lease and permit: hand the lease back so
            // no partial acquisition survives
            return lease.cancel();
        }
        permit = core.admission.clone().acquire_owned() => {
            permit.expect("admission semaphore is never closed")
        }
    };

    core.runs.increment();
    tracing::trace!(
        live = core.runs.get(),
        available = core.admission.available_permits(),
        "inner stream admitted"
    );
    tokio::spawn(run_inner(core.clone(), inner, lease, permit));
    Ok(())
}

/// Runs one admitted inner stream to completion, interruption or failure.
async fn run_inner<T: Send + 'static>(
    core: Arc<JoinCore<T>>,
    mut inner: ChunkStream<T>,
    lease: Lease,
    permit: OwnedSemaphorePermit,
) {
    let mut failure = None;
    loop {
        let pulled = tokio::select! {
            biased;
            pulled = inner.next() => pulled,
            _ = core.signal.interrupted() => break,
        };
        match pulled {
            None => break,
            Some(Err(err)) => {
                failure = Some(err);
                break;
            }
            Some(Ok(chunk)) => {
                // The interruption check comes after the send, never before:
                // the send itself is raced against the signal, so a stop
                // raised while the consumer is gone releases this rendezvous
                // instead of leaving it parked forever
                let interrupted = tokio::select! {
                    biased;
                    sent = core.output.send(chunk) => sent.is_err(),
                    _ = core.signal.interrupted() => true,
                };
                if interrupted {
                    break;
                }
            }
        }
    }

    // Release the pull before the lease: the inner stream may borrow
    // resources the finalizers tear down
    drop(inner);
    let finalization = lease.cancel().err();
    drop(permit);
    core.finish(Error::compose_opt(failure, finalization)).await;
}
