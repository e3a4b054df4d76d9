//! Concurrent stream join.
//!
//! [`par_join`] merges a stream of inner streams into a single stream of
//! chunks, evaluating at most `max_open` inner streams at a time. The
//! interleaving of chunks from different inner streams is non-deterministic;
//! chunks of a single inner stream keep their order.
//!
//! ## How It Works
//!
//!```text
//!                        ┌──────────────┐
//!  outer stream ───────► │ outer driver │  (one run unit for its lifetime)
//!                        └──────┬───────┘
//!            lease ► permit ► count ► spawn     admission, ≤ max_open
//!           ┌──────────┐  ┌──────────┐  ┌──────────┐
//!           │ runner 0 │  │ runner 1 │  │ runner 2 │  ...
//!           └─────┬────┘  └────┬─────┘  └────┬─────┘
//!                 └──────► [ rendezvous ] ◄──┘    Some(chunk)*, None
//!                               │
//!                               ▼
//!                          JoinStream ────► Ok(chunk)*, then at most one Err
//!```
//!
//! Four shared primitives coordinate the tasks, all of them injected through
//! one `JoinCore` value:
//!
//! | Primitive | Module | Role |
//! |-----------|--------|------|
//! | termination signal | `signal` | interrupts every pull and send, carries the composed error |
//! | run counter | `counter` | counts live producers; zero triggers the final stop |
//! | admission semaphore | `tokio::sync` | bounds concurrent inner streams to `max_open` |
//! | rendezvous hand-off | `handoff` | backpressured chunk transfer, `None`-terminated |
//!
//! ## Termination
//!
//! Whatever requests the first stop, it flips the signal and delivers the
//! single end-of-stream sentinel. The
//! consumer then waits for the run counter to drain before reporting, so the
//! terminal error is stable and complete: failures that race each other are
//! composed into one inspectable [`Composite`](crate::error::Composite).
//!
//! Dropping the [`JoinStream`] before the end cancels the join: producers
//! observe the signal, release their lease and permit, and the join
//! quiesces on its own.
//!
//! ## Example
//!
//!```
//! use braid::{ChunkStream, par_join};
//! use futures::{StreamExt, stream};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let inners = (0..3).map(|i| -> ChunkStream<i32> {
//!     stream::iter([Ok(vec![i * 10, i * 10 + 1])]).boxed()
//! });
//! let outer = stream::iter(inners.map(Ok));
//!
//! let mut elements: Vec<i32> = par_join(outer, 2)
//!     .map(|chunk| chunk.unwrap())
//!     .concat()
//!     .await;
//! elements.sort();
//! assert_eq!(elements, vec![0, 1, 10, 11, 20, 21]);
//! # }
//! ```

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    FutureExt, Stream, StreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use tokio::sync::Semaphore;

use crate::{error::Error, scope::Scope};

mod counter;
mod handoff;
mod runner;
mod signal;

use runner::JoinCore;

/// An ordered batch of elements delivered as one unit.
pub type Chunk<T> = Vec<T>;

/// An inner stream: chunks until exhaustion, or a terminal error.
pub type ChunkStream<T> = BoxStream<'static, Result<Chunk<T>, Error>>;

/// The outer stream: inner streams until exhaustion, or a terminal error.
pub(crate) type OuterStream<T> = BoxStream<'static, Result<ChunkStream<T>, Error>>;

/// Element of a two-sided merge, tagging which input it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// Joins the inner streams of `outer`, at most `max_open` at a time, under a
/// private [`Scope`].
///
/// The returned stream yields the chunks of all inner streams in a
/// non-deterministic interleaving and terminates normally iff every stream
/// terminated normally; otherwise it ends with the composed error.
///
/// # Panics
///
/// Panics when `max_open` is zero, synchronously and before any task exists.
/// The stream must be polled inside a Tokio runtime.
pub fn par_join<T, S>(outer: S, max_open: usize) -> JoinStream<T>
where
    T: Send + 'static,
    S: Stream<Item = Result<ChunkStream<T>, Error>> + Send + 'static,
{
    par_join_in(Scope::new(), outer, max_open)
}

/// [`par_join`] against a caller-provided [`Scope`].
///
/// Every spawned inner stream holds a [`Lease`](crate::scope::Lease) on
/// `scope` for its whole run, so the scope's finalizers wait for the join's
/// producers. The scope must stay open while inner streams are being
/// admitted: a lease refused because the scope was already closed fails the
/// join with [`Error::LeaseOnClosedScope`].
pub fn par_join_in<T, S>(scope: Scope, outer: S, max_open: usize) -> JoinStream<T>
where
    T: Send + 'static,
    S: Stream<Item = Result<ChunkStream<T>, Error>> + Send + 'static,
{
    assert!(max_open >= 1, "max_open must be at least 1");
    let (output, items) = handoff::channel();
    let core = Arc::new(JoinCore::new(scope, max_open, output));
    JoinStream {
        core,
        items,
        state: State::Idle(Some(outer.boxed())),
    }
}

/// [`par_join`] without an admission bound.
pub fn par_join_unbounded<T, S>(outer: S) -> JoinStream<T>
where
    T: Send + 'static,
    S: Stream<Item = Result<ChunkStream<T>, Error>> + Send + 'static,
{
    par_join_in(Scope::new(), outer, Semaphore::MAX_PERMITS)
}

/// Merges two streams into one, tagging each chunk's elements with the side
/// it came from. Entirely a [`par_join`] of the two with `max_open = 2`.
pub fn either<L, R, A, B>(left: A, right: B) -> JoinStream<Either<L, R>>
where
    L: Send + 'static,
    R: Send + 'static,
    A: Stream<Item = Result<Chunk<L>, Error>> + Send + 'static,
    B: Stream<Item = Result<Chunk<R>, Error>> + Send + 'static,
{
    let left: ChunkStream<Either<L, R>> = left
        .map(|r| r.map(|chunk| chunk.into_iter().map(Either::Left).collect()))
        .boxed();
    let right: ChunkStream<Either<L, R>> = right
        .map(|r| r.map(|chunk| chunk.into_iter().map(Either::Right).collect()))
        .boxed();
    par_join(futures::stream::iter([Ok(left), Ok(right)]), 2)
}

/// The joined output stream.
///
/// Yields `Ok(chunk)` for every chunk handed over by an inner stream, then
/// terminates, with a single trailing `Err` when any producer failed. The
/// error is read only after all producers have wound down, so it contains
/// every failure that raced the shutdown.
#[must_use = "streams do nothing unless polled"]
pub struct JoinStream<T: 'static> {
    core: Arc<JoinCore<T>>,
    items: handoff::Receiver<Chunk<T>>,
    state: State<T>,
}

enum State<T> {
    /// Driver not spawned yet; holds the outer stream until the first poll.
    Idle(Option<OuterStream<T>>),
    /// Chunks flowing.
    Streaming,
    /// Sentinel seen; waiting for the run counter to drain.
    Draining(BoxFuture<'static, ()>),
    /// Terminal outcome delivered.
    Done,
}

impl<T: Send + 'static> Stream for JoinStream<T> {
    type Item = Result<Chunk<T>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Idle(outer) => {
                    if let Some(outer) = outer.take() {
                        tokio::spawn(runner::drive_outer(this.core.clone(), outer));
                    }
                    this.state = State::Streaming;
                }
                State::Streaming => match futures::ready!(this.items.poll_next_unpin(cx)) {
                    Some(chunk) => return Poll::Ready(Some(Ok(chunk))),
                    None => {
                        let core = this.core.clone();
                        this.state =
                            State::Draining(async move { core.runs.quiesced().await }.boxed());
                    }
                },
                State::Draining(quiesced) => {
                    futures::ready!(quiesced.as_mut().poll(cx));
                    this.state = State::Done;
                    return match this.core.signal.get() {
                        signal::Stop::Failed(err) => Poll::Ready(Some(Err(err))),
                        _ => Poll::Ready(None),
                    };
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

// Walking away from an unfinished join is a cancellation: raise the signal
// so detached producers wind down and drain the run counter on their own.
impl<T> Drop for JoinStream<T> {
    fn drop(&mut self) {
        if !matches!(self.state, State::Idle(_) | State::Done) {
            self.core.cancel_now();
        }
    }
}
