//! Scopes and leases.
//!
//! A [`Scope`] owns a set of finalizers that must run once the scope is
//! closed and nobody borrows it anymore. A [`Lease`] is such a borrow: while
//! at least one lease is outstanding, closing the scope only *marks* it
//! closed and finalization is deferred to the release of the last lease.
//!
//! The join engine leases the outer scope once per spawned inner stream, so
//! resources owned by the outer pull stay alive for as long as any inner
//! producer still runs:
//!
//!```text
//!  Scope ── defer(f₁) ── defer(f₂) ── close()
//!    │                                  │
//!    ├── lease() ─────────── cancel() ──┤
//!    └── lease() ──────────────── cancel() ──► f₁, f₂ run here
//!```
//!
//! Finalizers run exactly once, in registration order; their errors are
//! composed into a single [`Error`] and returned from whichever call
//! triggered finalization.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

type Finalizer = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// Shared handle to a set of scoped resources.
///
/// Cloning is cheap and every clone addresses the same scope.
#[derive(Clone, Default)]
pub struct Scope {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    closed: bool,
    leases: usize,
    finalizers: Vec<Finalizer>,
}

impl State {
    /// Takes the finalizers out when the scope is ready to finalize.
    ///
    /// Must be called with the lock held; returns an empty vec otherwise,
    /// so finalizers can never be taken twice.
    fn drain_if_ready(&mut self) -> Vec<Finalizer> {
        if self.closed && self.leases == 0 {
            std::mem::take(&mut self.finalizers)
        } else {
            Vec::new()
        }
    }
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a finalizer to run when the scope finalizes.
    ///
    /// If the scope is already closed the finalizer runs immediately; a
    /// failure on that path is reported through `tracing` since there is no
    /// caller left to hand it to.
    pub fn defer(&self, f: impl FnOnce() -> Result<(), Error> + Send + 'static) {
        let mut state = self.inner.lock();
        if state.closed {
            drop(state);
            if let Err(err) = f() {
                tracing::warn!(%err, "finalizer registered on closed scope failed");
            }
        } else {
            state.finalizers.push(Box::new(f));
        }
    }

    /// Borrows the scope, keeping finalization at bay until the lease is
    /// cancelled. Returns `None` once the scope has been closed.
    pub fn lease(&self) -> Option<Lease> {
        let mut state = self.inner.lock();
        if state.closed {
            return None;
        }
        state.leases += 1;
        Some(Lease {
            scope: self.inner.clone(),
            released: false,
        })
    }

    /// Closes the scope. Idempotent.
    ///
    /// With no lease outstanding the finalizers run here and their composed
    /// error is returned; otherwise finalization is deferred to the last
    /// lease release and this returns `Ok(())`.
    pub fn close(&self) -> Result<(), Error> {
        let to_run = {
            let mut state = self.inner.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.drain_if_ready()
        };
        match run_finalizers(to_run) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases
    }
}

/// A borrow of a [`Scope`], handed to each spawned inner producer.
#[must_use = "an unreleased lease keeps its scope from finalizing"]
pub struct Lease {
    scope: Arc<Mutex<State>>,
    released: bool,
}

impl Lease {
    /// Releases the borrow. When this was the last lease of a closed scope,
    /// the finalizers run here and their composed error is returned.
    pub fn cancel(mut self) -> Result<(), Error> {
        match self.release() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Option<Error> {
        if self.released {
            return None;
        }
        self.released = true;
        let to_run = {
            let mut state = self.scope.lock();
            state.leases -= 1;
            state.drain_if_ready()
        };
        run_finalizers(to_run)
    }
}

// Fallback for leases that are dropped instead of cancelled: the borrow must
// not outlive its holder, and a finalizer error has nowhere to go but the log.
impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(err) = self.release() {
            tracing::warn!(%err, "finalizer failed while releasing a dropped lease");
        }
    }
}

/// Runs finalizers in registration order, composing their errors.
fn run_finalizers(finalizers: Vec<Finalizer>) -> Option<Error> {
    let mut out = None;
    for f in finalizers {
        if let Err(err) = f() {
            out = Error::compose_opt(out, Some(err));
        }
    }
    out
}
