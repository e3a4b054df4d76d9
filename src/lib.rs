//! Concurrent stream join engine.
//!
//! `braid` merges a stream of inner streams into one output stream of
//! chunks, evaluating at most `max_open` inner streams concurrently:
//!
//! - **Backpressured**: chunks cross a zero-capacity rendezvous, so
//!   producers run no further ahead than the consumer pulls.
//! - **Bounded**: admission is gated by a semaphore; the outer stream is not
//!   pulled while the join is at capacity.
//! - **Cancel-correct**: dropping the output stream interrupts every pull
//!   and send; producers release their scope leases and permits and the join
//!   quiesces on its own.
//! - **Error-complete**: failures are never swallowed; concurrent failures
//!   compose into one inspectable composite, reported exactly once when the
//!   output terminates.
//!
//! The entry points are [`par_join`], [`par_join_unbounded`], [`either`] and
//! the scope-aware [`par_join_in`]; see the [`join`] module for the engine's
//! data flow and an example.

pub mod error;
pub mod join;
pub mod scope;

pub use error::{Composite, Error};
pub use join::{
    Chunk, ChunkStream, Either, JoinStream, either, par_join, par_join_in, par_join_unbounded,
};
pub use scope::{Lease, Scope};
