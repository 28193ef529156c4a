// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Intra-process memory pools.
//!
//! Two pooled allocators over a single up-front slab:
//!
//! 1. [`FixedPool`] - fixed-size objects, O(1) allocate and free through
//!    an intrusive free list threaded through per-slot header words.
//!
//! 2. [`VariablePool`] - variable-size blocks, first-fit allocation with
//!    splitting, and coalescing with both neighbors on free.
//!
//! Pools segregate the heap: a pool per thread keeps allocations off the
//! program's global allocator and lets everything leak-free out at once
//! when the pool is dropped. Both pools come in a mutex-protected flavor
//! (the safe default) and an unprotected one for confirmed
//! single-threaded use, which skips the lock entirely.

use parking_lot::Mutex;
use std::{cell::RefCell, io};

mod fixed_pool;
mod variable_pool;

pub use self::{fixed_pool::*, variable_pool::*};

/// Machine word, the granularity of all pool metadata.
pub(crate) const WORD: usize = std::mem::size_of::<usize>();

/// Tags a live fixed pool for cheap integrity checks.
pub(crate) const FIXED_POOL_MAGIC: usize = 0xdecaf123;

/// Tags a live variable pool for cheap integrity checks.
pub(crate) const VARIABLE_POOL_MAGIC: usize = 0xc0ffee12;

/// Whether a pool synchronizes its internal state.
///
/// An unprotected pool elides the mutex around its free list. That is
/// only sound when every allocate and free happens on one thread, which
/// is why the unprotected constructors are `unsafe`: the flag is a
/// contract the caller signs, not a property the pool can enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protect {
    /// Free-list operations take an internal mutex; the pool may be
    /// shared between threads.
    Protected,
    /// No internal locking; the pool must stay on a single thread.
    Unprotected,
}

/// The free-list state cell shared by both pool kinds: a mutex when the
/// pool is protected, a plain cell when the caller promised
/// single-threaded use.
pub(crate) enum PoolAccess<T> {
    Protected(Mutex<T>),
    Unprotected(RefCell<T>),
}

impl<T> PoolAccess<T> {
    pub(crate) fn new(protect: Protect, state: T) -> PoolAccess<T> {
        match protect {
            Protect::Protected => PoolAccess::Protected(Mutex::new(state)),
            Protect::Unprotected => PoolAccess::Unprotected(RefCell::new(state)),
        }
    }

    /// Runs `f` with exclusive access to the state.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        match self {
            PoolAccess::Protected(mutex) => f(&mut mutex.lock()),
            PoolAccess::Unprotected(cell) => f(&mut cell.borrow_mut()),
        }
    }
}

impl<T> std::fmt::Debug for PoolAccess<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolAccess::Protected(_) => f.write_str("PoolAccess::Protected"),
            PoolAccess::Unprotected(_) => f.write_str("PoolAccess::Unprotected"),
        }
    }
}

/// Rounds `n` up to the next multiple of the machine word.
pub(crate) fn word_round(n: usize) -> usize {
    (n + WORD - 1) & !(WORD - 1)
}

/// Locks the slab's pages into physical memory.
#[cfg(unix)]
pub(crate) fn pin_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    let addr = std::ptr::NonNull::new(ptr as *mut std::ffi::c_void)
        .expect("pool slabs are never null");
    unsafe { nix::sys::mman::mlock(addr, len) }.map_err(io::Error::from)
}

/// Unlocks the slab's pages.
#[cfg(unix)]
pub(crate) fn unpin_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    let addr = std::ptr::NonNull::new(ptr as *mut std::ffi::c_void)
        .expect("pool slabs are never null");
    unsafe { nix::sys::mman::munlock(addr, len) }.map_err(io::Error::from)
}

// Platforms without mlock: pinning silently succeeds.
#[cfg(not(unix))]
pub(crate) fn pin_region(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn unpin_region(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn word_round_is_tight() {
        assert_eq!(word_round(0), 0);
        assert_eq!(word_round(1), WORD);
        assert_eq!(word_round(WORD), WORD);
        assert_eq!(word_round(WORD + 1), 2 * WORD);
    }
}
