// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Set of synchronization primitives.
//!
//! Following primitives are provided.
//!
//! 1. Semaphore - A counting semaphore maintaining a set of units. Each
//!    call to [`down`] blocks the calling thread if necessary until the
//!    requested units are available, and then takes them. Each call to
//!    [`up`] adds units, potentially releasing blocked waiters. Both come
//!    in deadline-bounded variants.
//!
//! 2. RwLock - A reader-writer lock with the same meaning as
//!    [`std::sync::RwLock`], except that it cannot be poisoned and both
//!    acquires have deadline-bounded variants.
//!
//! 3. Barrier - A reusable sense-reversing rendezvous point for a fixed
//!    set of threads.
//!
//! [`down`]: Semaphore::down
//! [`up`]: Semaphore::up

mod barrier;
mod rwlock;
mod semaphore;

pub use self::{barrier::*, rwlock::*, semaphore::*};
