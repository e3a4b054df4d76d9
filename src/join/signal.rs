//! Termination signal of a join.
//!
//! One observable cell shared by every producer and the consumer. It holds
//! the tri-state termination value and is the join's single source of truth
//! for "keep running / wind down cleanly / wind down with this error".
//!
//! Built on [`tokio::sync::watch`], which gives the two properties the cell
//! needs at once: linearizable read-modify-write (`send_modify` runs the
//! update closure exactly once, under the cell's lock) and change
//! notification for any number of subscribers. A plain atomic gives neither
//! the compose-under-update nor the wakeups.

use tokio::sync::watch;

use crate::error::Error;

/// Tri-state termination value. Monotonic: once out of `Running`, a cell
/// never goes back, and errors only accumulate.
#[derive(Debug, Clone, Default)]
pub(crate) enum Stop {
    #[default]
    Running,
    /// Graceful termination requested, no error observed.
    Clean,
    /// Termination requested with the composed error so far.
    Failed(Error),
}

pub(crate) struct StopSignal {
    cell: watch::Sender<Stop>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            cell: watch::Sender::new(Stop::Running),
        }
    }

    /// Requests termination, folding `err` into the current state:
    ///
    /// - `Running` becomes `Clean` or `Failed(err)`;
    /// - `Clean` upgrades to `Failed(err)` when an error arrives;
    /// - `Failed(e0)` composes: `Failed(compose(e0, err))`.
    ///
    /// The update closure runs exactly once per call, so a given error is
    /// never composed twice.
    pub(crate) fn raise(&self, err: Option<Error>) {
        self.cell.send_modify(|state| {
            let current = std::mem::take(state);
            *state = match (current, err) {
                (Stop::Running, None) => Stop::Clean,
                (Stop::Running | Stop::Clean, Some(e)) => Stop::Failed(e),
                (Stop::Clean, None) => Stop::Clean,
                (Stop::Failed(e0), Some(e)) => Stop::Failed(e0.compose(e)),
                (Stop::Failed(e0), None) => Stop::Failed(e0),
            };
        });
    }

    /// Snapshot of the current state.
    pub(crate) fn get(&self) -> Stop {
        self.cell.borrow().clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.cell.borrow(), Stop::Running)
    }

    /// Resolves once the state leaves `Running`. Every pull and every send
    /// in the engine is raced against this future.
    pub(crate) async fn interrupted(&self) {
        let mut rx = self.cell.subscribe();
        // Cannot fail: `self` keeps the sender alive across the await
        let _ = rx.wait_for(|state| !matches!(state, Stop::Running)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boom(msg: &str) -> Error {
        Error::producer(std::io::Error::other(msg.to_owned()))
    }

    /// Clean stop: Running → Clean, and errors can still upgrade it
    #[test]
    fn test_clean_then_error() {
        let signal = StopSignal::new();
        assert!(signal.is_running());

        signal.raise(None);
        assert!(matches!(signal.get(), Stop::Clean));
        assert!(!signal.is_running());

        signal.raise(Some(boom("late")));
        assert!(matches!(signal.get(), Stop::Failed(_)));
    }

    /// Racing errors compose instead of overwriting each other
    #[test]
    fn test_errors_compose() {
        let signal = StopSignal::new();
        signal.raise(Some(boom("first")));
        signal.raise(Some(boom("second")));

        let Stop::Failed(err) = signal.get() else {
            panic!("should hold an error")
        };
        assert_eq!(err.to_string(), "producer failed: first (1 suppressed)");
    }

    /// Repeated clean stops are no-ops, also on a failed cell
    #[test]
    fn test_idempotent_stop() {
        let signal = StopSignal::new();
        signal.raise(Some(boom("only")));
        for _ in 0..3 {
            signal.raise(None);
        }
        let Stop::Failed(err) = signal.get() else {
            panic!("should hold an error")
        };
        assert_eq!(err.to_string(), "producer failed: only");
    }

    /// interrupted() suspends while running and wakes on the transition
    #[tokio::test]
    async fn test_interrupted_wakes() {
        let signal = std::sync::Arc::new(StopSignal::new());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.interrupted().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        signal.raise(None);
        waiter.await.unwrap();
    }

    /// interrupted() resolves immediately once already stopped
    #[tokio::test]
    async fn test_interrupted_after_stop() {
        let signal = StopSignal::new();
        signal.raise(Some(boom("gone")));
        signal.interrupted().await;
    }
}
