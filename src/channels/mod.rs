// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Queues connecting producer threads to consumer threads.
//!
//! [`PcQueue`] is a bounded FIFO assembled from the crate's own
//! primitives: two counting semaphores track capacity and occupancy, a
//! mutex guards the link structure, and node storage comes from a fixed
//! memory pool allocated up front.

mod pc_queue;

pub use self::pc_queue::*;
