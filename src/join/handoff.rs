//! Output hand-off of a join.
//!
//! A rendezvous (zero-capacity) channel carrying `Some(item)` values
//! terminated by a single `None` sentinel:
//!
//!```text
//!  runner ──┐
//!  runner ──┼──► [ rendezvous ] ──► consumer
//!  runner ──┘        Some(chunk)*, None
//!```
//!
//! | Property | Behavior |
//! |----------|----------|
//! | Capacity | Zero: a send completes only when the consumer receives |
//! | Sentinel | Exactly one `None`, ever, however many closes race |
//! | After close | Sends observed as closed, item handed back untouched |
//! | After sentinel | Receives yield end-of-stream forever (fused) |
//!
//! The rendezvous itself is [`flume::bounded(0)`](flume::bounded); this
//! module adds the sentinel protocol on top. The one-shot close flag is
//! shared by all senders and sits on its own cache line, away from the
//! channel internals both sides hammer on.
//!
//! A sender blocked in the rendezvous is *not* released by `close`; the
//! caller is expected to race its sends against the termination signal,
//! which is raised before any close.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use crossbeam_utils::CachePadded;
use futures::{Stream, StreamExt};

/// Error handed back when the hand-off no longer accepts items; the rejected
/// item is returned to the caller so nothing is silently dropped.
#[derive(Debug)]
pub(crate) struct Closed<T>(pub(crate) T);

pub(crate) fn channel<T: 'static>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = flume::bounded(0);
    let sender = Sender {
        tx,
        closed: Arc::new(CachePadded::new(AtomicBool::new(false))),
    };
    let receiver = Receiver {
        items: rx.into_stream(),
        done: false,
    };
    (sender, receiver)
}

pub(crate) struct Sender<T> {
    tx: flume::Sender<Option<T>>,
    closed: Arc<CachePadded<AtomicBool>>,
}

// Manual impl: `T: Clone` is not required to clone a handle
impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> Sender<T> {
    /// Hands one item to the consumer.
    ///
    /// Suspends until the consumer receives it (rendezvous). Fails with
    /// [`Closed`] once the hand-off has been closed or the receiver is gone.
    ///
    /// # Cancel Safety
    ///
    /// Cancel-safe for the protocol: dropping the future before the
    /// rendezvous withdraws the item, and the consumer never observes it.
    pub(crate) async fn send(&self, item: T) -> Result<(), Closed<T>> {
        if self.is_closed() {
            return Err(Closed(item));
        }
        self.tx.send_async(Some(item)).await.map_err(|rejected| {
            match rejected.into_inner() {
                Some(item) => Closed(item),
                // Only `close` sends the sentinel; it is never handed back here
                None => unreachable!("sentinel returned from an item send"),
            }
        })
    }

    /// Delivers the end-of-stream sentinel.
    ///
    /// One-shot: the first close wins the flag and performs the rendezvous;
    /// every later close returns immediately. A sentinel that finds no
    /// receiver is dropped; a consumer that went away has already observed
    /// shutdown.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send_async(None).await;
    }

    /// Marks the hand-off closed without delivering the sentinel.
    ///
    /// For the path where the receiver itself is being dropped: there is
    /// nobody left to rendezvous with, but later sends must still be turned
    /// away.
    pub(crate) fn close_now(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Consumer half. Yields items until the sentinel (or a disconnection), then
/// end-of-stream forever.
pub(crate) struct Receiver<T: 'static> {
    items: flume::r#async::RecvStream<'static, Option<T>>,
    done: bool,
}

impl<T: 'static> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match futures::ready!(this.items.poll_next_unpin(cx)) {
            Some(Some(item)) => Poll::Ready(Some(item)),
            // Sentinel, or every sender dropped: terminal either way
            Some(None) | None => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A send suspends until the consumer actually receives (rendezvous)
    #[tokio::test]
    async fn test_rendezvous() {
        let (tx, mut rx) = channel::<i32>();

        let send = tokio::spawn(async move {
            tx.send(7).await.unwrap();
            tx
        });
        tokio::task::yield_now().await;
        assert!(!send.is_finished());

        assert_eq!(rx.next().await, Some(7));
        send.await.unwrap();
    }

    /// The sentinel terminates the stream, and the stream stays terminated
    #[tokio::test]
    async fn test_sentinel_terminates() {
        let (tx, mut rx) = channel::<i32>();

        let closer = tokio::spawn(async move {
            tx.close().await;
            tx
        });

        assert_eq!(rx.next().await, None);
        assert_eq!(rx.next().await, None);

        // Sends after close are turned away with the item intact
        let tx = closer.await.unwrap();
        let Closed(rejected) = tx.send(3).await.expect_err("should err");
        assert_eq!(rejected, 3);
    }

    /// Racing closes deliver exactly one sentinel
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_once() {
        let (tx, mut rx) = channel::<i32>();

        let mut closers = Vec::new();
        for _ in 0..8 {
            let tx = tx.clone();
            closers.push(tokio::spawn(async move { tx.close().await }));
        }

        // One sentinel comes through; were a second one delivered, it would
        // rendezvous with this second receive and yield a bogus `Some`
        assert_eq!(rx.next().await, None);
        for closer in closers {
            closer.await.unwrap();
        }
        assert_eq!(rx.next().await, None);
        assert!(tx.is_closed());
    }

    /// Multiple producers interleave through the same hand-off
    #[tokio::test]
    async fn test_multiple_senders() {
        let (tx, rx) = channel::<usize>();

        for i in 0..4 {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(i).await });
        }

        let mut got: Vec<usize> = rx.take(4).collect().await;
        got.sort_unstable();
        assert_eq!(got, [0, 1, 2, 3]);
    }

    /// A dropped receiver turns senders away instead of wedging them
    #[tokio::test]
    async fn test_receiver_gone() {
        let (tx, rx) = channel::<i32>();
        drop(rx);

        let Closed(rejected) = tx.send(5).await.expect_err("should err");
        assert_eq!(rejected, 5);

        // close() must not wedge either
        tx.close().await;
    }

    /// close_now closes the flag without a rendezvous
    #[tokio::test]
    async fn test_close_now() {
        let (tx, mut rx) = channel::<i32>();
        tx.close_now();
        assert!(tx.is_closed());

        let Closed(rejected) = tx.send(9).await.expect_err("should err");
        assert_eq!(rejected, 9);

        // No sentinel was delivered; the stream ends by sender disconnect
        drop(tx);
        assert_eq!(rx.next().await, None);
    }
}
