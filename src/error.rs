//! Error taxonomy of the join engine.
//!
//! Every failure observed while a join is running is routed through the
//! termination signal and re-raised exactly once at the join boundary. Failures that race with each other are folded into a single
//! [`Composite`] that keeps the first-observed error as primary and the
//! rest as suppressed causes, so callers can inspect all of them.

use std::sync::Arc;

/// Terminal error of a join.
///
/// `Clone` is required: the error lives in the shared termination signal
/// while producers wind down and is handed out once at the stream boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An inner or outer stream failed.
    #[error("producer failed: {0}")]
    Producer(Arc<dyn std::error::Error + Send + Sync>),

    /// A scope finalizer failed while a lease was being released.
    #[error("finalizer failed: {0}")]
    Finalizer(Arc<dyn std::error::Error + Send + Sync>),

    /// An inner runner asked for a lease on a scope that was already closed.
    ///
    /// The scope that owns the outer stream must stay open for as long as
    /// inner streams are being spawned; hitting this kind means the caller
    /// tore the scope down while the join was still admitting producers.
    #[error("lease requested on a closed scope")]
    LeaseOnClosedScope,

    /// The consumer dropped the join before the streams were exhausted.
    #[error("join cancelled by its consumer")]
    Cancelled,

    /// Several failures raced; all of them are retained.
    #[error(transparent)]
    Composite(Composite),
}

/// Carrier for concurrent failures: one primary plus the suppressed rest.
///
/// Which failure ends up primary is whichever reached the termination signal
/// first; suppressed errors keep their arrival order.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{primary} ({} suppressed)", .suppressed.len())]
pub struct Composite {
    pub primary: Box<Error>,
    pub suppressed: Vec<Error>,
}

impl Error {
    /// Wraps an arbitrary stream failure.
    pub fn producer(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Producer(Arc::new(err))
    }

    /// Wraps a failing scope finalizer.
    pub fn finalizer(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Finalizer(Arc::new(err))
    }

    /// Folds `other` into `self`, flattening nested composites so the result
    /// is always a single-level `primary + suppressed` carrier.
    ///
    /// Associative and commutative up to the order of the suppressed list.
    pub fn compose(self, other: Error) -> Error {
        let (primary, mut suppressed) = match self {
            Error::Composite(c) => (c.primary, c.suppressed),
            e => (Box::new(e), Vec::new()),
        };
        match other {
            Error::Composite(c) => {
                suppressed.push(*c.primary);
                suppressed.extend(c.suppressed);
            }
            e => suppressed.push(e),
        }
        Error::Composite(Composite {
            primary,
            suppressed,
        })
    }

    /// [`compose`](Self::compose) lifted over optional sides.
    pub fn compose_opt(a: Option<Error>, b: Option<Error>) -> Option<Error> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.compose(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// True when `self` is, or contains, an error for which `pred` holds.
    pub fn contains(&self, pred: impl Fn(&Error) -> bool + Copy) -> bool {
        match self {
            Error::Composite(c) => pred(&c.primary) || c.suppressed.iter().any(pred),
            e => pred(e),
        }
    }
}
