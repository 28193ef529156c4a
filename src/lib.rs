// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! # Lockstep - blocking synchronization and pooled-memory primitives.
//!
//! ## What is Lockstep
//!
//! Lockstep is a companion toolkit for programs built directly on
//! platform threads. It supplements the standard library with the
//! primitives such programs keep rewriting by hand:
//!
//! * a counting [`Semaphore`] with multi-unit and deadline-bounded
//!   operations,
//! * a reader-writer lock ([`RwLock`]) with timed acquires,
//! * a reusable sense-reversing [`Barrier`],
//! * two intra-process memory pools - [`FixedPool`] with O(1)
//!   allocate/free and first-fit, coalescing [`VariablePool`] - both in
//!   mutex-protected and single-threaded flavors,
//! * a bounded producer/consumer queue ([`PcQueue`]) built from the
//!   semaphores and a fixed pool,
//! * a worker [`ThreadPool`] whose submissions return joinable
//!   [`TaskFuture`]s.
//!
//! The pieces compose bottom-up: the queue's capacity discipline is two
//! semaphores, its node storage is a fixed pool, the thread pool's
//! dispatch and its futures are semaphores again. Nothing here spins;
//! every blocked thread sleeps on a condition variable.
//!
//! ## Timed operations
//!
//! Every blocking operation with a `timed_` or `_timeout` variant
//! converts its relative timeout to an absolute deadline exactly once
//! and charges all internal waiting against it (see [`timer::Deadline`]).
//! On `TimedOut` the operation has mutated nothing, so callers can
//! retry, back off or give up without cleanup.
//!
//! ## Example
//!
//! A tiny pipeline: a bounded queue between producers and a worker pool,
//! with a semaphore bounding how much work is outstanding.
//!
//! ```
//! use lockstep::{channels::PcQueue, executor::ThreadPool};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(PcQueue::new(8).unwrap());
//! let pool = ThreadPool::fixed(2).unwrap();
//!
//! for i in 0..8 {
//!     queue.enqueue(i).unwrap();
//! }
//!
//! let consumer_queue = Arc::clone(&queue);
//! let future = pool
//!     .execute(move || {
//!         let mut sum = 0;
//!         for _ in 0..8 {
//!             sum += consumer_queue.dequeue().unwrap();
//!         }
//!         sum
//!     })
//!     .unwrap();
//!
//! assert_eq!(future.join().unwrap(), (0..8).sum());
//! ```
//!
//! ## Memory pools and unsafety
//!
//! The pools hand out raw, uninitialized, word-aligned memory and take
//! it back through `free`; they are allocators, not containers, and the
//! usual allocator contract applies. The unprotected pool flavors skip
//! internal locking entirely and are therefore `unsafe` to construct:
//! the caller signs the single-thread contract the C tradition left as a
//! comment.
//!
//! ## Shutdown discipline
//!
//! Long-lived primitives shut down through types, not sentinels: the
//! semaphore and the queue expose `close()` which wakes every blocked
//! thread with a `Closed` error (producers get their rejected element
//! back), and dropping a [`ThreadPool`] drains in-flight callbacks, then
//! joins every worker.
//!
//! [`Semaphore`]: sync::Semaphore
//! [`RwLock`]: sync::RwLock
//! [`Barrier`]: sync::Barrier
//! [`FixedPool`]: memory::FixedPool
//! [`VariablePool`]: memory::VariablePool
//! [`PcQueue`]: channels::PcQueue
//! [`ThreadPool`]: executor::ThreadPool
//! [`TaskFuture`]: executor::TaskFuture
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod error;

pub mod channels;
pub mod executor;
pub mod memory;
pub mod sync;
pub mod timer;

pub use crate::error::{LockstepError, ResourceType, Result};
pub use enclose::enclose;
