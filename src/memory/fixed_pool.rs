// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::{
    error::{LockstepError, ResourceType},
    memory::{
        pin_region, unpin_region, word_round, PoolAccess, Protect, FIXED_POOL_MAGIC, WORD,
    },
};
use log::debug;
use std::{alloc, ptr::NonNull};

type Result<T> = crate::error::Result<T, ()>;

struct FreeList {
    head: *mut u8,
}

/// The pool header lives behind a `Box` so its address stays stable when
/// the `FixedPool` value moves; allocated slots point back at it.
struct FixedInner {
    magic: usize,
    slab: *mut u8,
    slab_size: usize,
    object_size: usize,
    stored_size: usize,
    capacity: usize,
    owns_slab: bool,
    free: PoolAccess<FreeList>,
}

/// A pool of fixed-size objects with O(1) allocate and free.
///
/// One slab of `(object size + one header word) * capacity` bytes is
/// obtained up front and stitched into a singly-linked free list threaded
/// through the header words, so allocation is a deterministic-time list
/// pop and free a list push. While a slot is allocated, its header word
/// holds a back-pointer to the owning pool, which [`free`] uses to verify
/// the address really came from this pool.
///
/// Returned addresses are word-aligned and point at uninitialized
/// memory; they stay valid until they are freed or the pool is dropped.
///
/// # Examples
///
/// ```
/// use lockstep::memory::FixedPool;
///
/// let pool = FixedPool::new(64, 8).unwrap();
/// let addr = pool.alloc().unwrap();
/// unsafe {
///     addr.as_ptr().write(17u8);
///     pool.free(addr).unwrap();
/// }
/// ```
///
/// [`free`]: FixedPool::free
pub struct FixedPool {
    inner: Box<FixedInner>,
}

// Protected pools guard every free-list touch with the internal mutex.
// Unprotected pools can only be built through an unsafe constructor whose
// contract confines them to one thread.
unsafe impl Send for FixedPool {}
unsafe impl Sync for FixedPool {}

impl std::fmt::Debug for FixedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPool")
            .field("object_size", &self.inner.object_size)
            .field("capacity", &self.inner.capacity)
            .field("slab_size", &self.inner.slab_size)
            .field("free", &self.inner.free)
            .finish()
    }
}

impl FixedPool {
    /// Creates a mutex-protected pool of `capacity` objects of
    /// `object_size` bytes each, allocating the slab from the global
    /// allocator.
    pub fn new(object_size: usize, capacity: usize) -> Result<FixedPool> {
        Self::build(object_size, capacity, Protect::Protected, None)
    }

    /// Creates a pool without internal locking.
    ///
    /// # Safety
    ///
    /// The caller must confine the pool to a single thread: every
    /// [`alloc`] and [`free`] must happen on the thread that created it.
    ///
    /// [`alloc`]: FixedPool::alloc
    /// [`free`]: FixedPool::free
    pub unsafe fn new_unprotected(object_size: usize, capacity: usize) -> Result<FixedPool> {
        Self::build(object_size, capacity, Protect::Unprotected, None)
    }

    /// Creates a pool inside a caller-provided block of memory instead of
    /// allocating one, enabling pools nested inside other pools. The pool
    /// will not release the block on drop; whoever provided it owns it
    /// and must keep it alive for the pool's lifetime.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes and
    /// word-aligned, and must outlive the pool. For
    /// `Protect::Unprotected` the single-thread contract of
    /// [`new_unprotected`] applies as well.
    ///
    /// [`new_unprotected`]: FixedPool::new_unprotected
    pub unsafe fn from_raw_block(
        base: NonNull<u8>,
        size: usize,
        object_size: usize,
        capacity: usize,
        protect: Protect,
    ) -> Result<FixedPool> {
        if base.as_ptr() as usize % WORD != 0 {
            return Err(LockstepError::InvalidArgument(
                "pool block must be word-aligned",
            ));
        }

        let pool = Self::build(object_size, capacity, protect, Some((base, size)))?;
        Ok(pool)
    }

    fn build(
        object_size: usize,
        capacity: usize,
        protect: Protect,
        block: Option<(NonNull<u8>, usize)>,
    ) -> Result<FixedPool> {
        if object_size == 0 || capacity == 0 {
            return Err(LockstepError::InvalidArgument(
                "pool object size and capacity must be positive",
            ));
        }

        let stored_size = object_size
            .checked_add(2 * WORD - 1)
            .map(|_| WORD + word_round(object_size))
            .ok_or(LockstepError::InvalidArgument("pool size overflows"))?;
        let slab_size = stored_size
            .checked_mul(capacity)
            .ok_or(LockstepError::InvalidArgument("pool size overflows"))?;

        let (slab, owns_slab) = match block {
            Some((base, size)) => {
                if size < slab_size {
                    return Err(LockstepError::InvalidArgument(
                        "provided block is too small for the pool",
                    ));
                }
                (base.as_ptr(), false)
            }
            None => {
                let layout = alloc::Layout::from_size_align(slab_size, WORD)
                    .map_err(|_| LockstepError::InvalidArgument("pool size overflows"))?;
                // Safety: layout has non-zero size, checked above.
                let slab = unsafe { alloc::alloc(layout) };
                if slab.is_null() {
                    return Err(LockstepError::Exhausted(ResourceType::MemoryPool {
                        requested: slab_size,
                    }));
                }
                (slab, true)
            }
        };

        // Stitch the slots into a free list through their header words.
        // Paying for this up front is what makes alloc deterministic.
        unsafe {
            let mut slot = slab;
            for _ in 0..capacity - 1 {
                let next = slot.add(stored_size);
                (slot as *mut *mut u8).write(next);
                slot = next;
            }
            (slot as *mut *mut u8).write(std::ptr::null_mut());
        }

        debug!(
            "fixed pool created: {} objects of {} bytes ({} bytes slab)",
            capacity, object_size, slab_size
        );

        Ok(FixedPool {
            inner: Box::new(FixedInner {
                magic: FIXED_POOL_MAGIC,
                slab,
                slab_size,
                object_size,
                stored_size,
                capacity,
                owns_slab,
                free: PoolAccess::new(protect, FreeList { head: slab }),
            }),
        })
    }

    /// Allocates one object, returning the address of its first byte.
    ///
    /// Fails with `Exhausted` when every slot is taken. The memory is
    /// uninitialized.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let inner = &*self.inner;
        let owner = inner as *const FixedInner as usize;

        inner.free.with(|list| {
            let slot = list.head;
            if slot.is_null() {
                return Err(LockstepError::Exhausted(ResourceType::MemoryPool {
                    requested: inner.object_size,
                }));
            }

            // Pop the head, then repurpose the header word as the owner
            // back-pointer for the integrity check in free().
            unsafe {
                list.head = (slot as *const *mut u8).read();
                (slot as *mut usize).write(owner);
                Ok(NonNull::new_unchecked(slot.add(WORD)))
            }
        })
    }

    /// Returns an object to the pool.
    ///
    /// Fails with `InvalidArgument` when the header word before `addr`
    /// does not point back at this pool.
    ///
    /// # Safety
    ///
    /// `addr` must have been returned by [`alloc`] on some pool and not
    /// freed since; the object must no longer be referenced.
    ///
    /// [`alloc`]: FixedPool::alloc
    pub unsafe fn free(&self, addr: NonNull<u8>) -> Result<()> {
        let inner = &*self.inner;
        let slot = addr.as_ptr().sub(WORD);

        let owner = (slot as *const usize).read();
        if owner != inner as *const FixedInner as usize || inner.magic != FIXED_POOL_MAGIC {
            return Err(LockstepError::InvalidArgument(
                "address was not allocated from this pool",
            ));
        }

        inner.free.with(|list| unsafe {
            (slot as *mut *mut u8).write(list.head);
            list.head = slot;
        });
        Ok(())
    }

    /// Locks the slab's pages into physical memory. Silently succeeds on
    /// platforms without such a call.
    pub fn pin(&self) -> Result<()> {
        pin_region(self.inner.slab, self.inner.slab_size)?;
        Ok(())
    }

    /// Unlocks the slab's pages.
    pub fn unpin(&self) -> Result<()> {
        unpin_region(self.inner.slab, self.inner.slab_size)?;
        Ok(())
    }

    /// The maximum number of simultaneously allocated objects.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The usable size of each object in bytes, as requested at
    /// construction.
    pub fn object_size(&self) -> usize {
        self.inner.object_size
    }

    #[cfg(test)]
    fn free_slots(&self) -> usize {
        self.inner.free.with(|list| {
            let mut count = 0;
            let mut slot = list.head;
            while !slot.is_null() {
                count += 1;
                slot = unsafe { (slot as *const *mut u8).read() };
            }
            count
        })
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        let inner = &mut *self.inner;
        inner.magic = 0;

        // Unpinning unlocked pages is harmless; do it unconditionally.
        let _ = unpin_region(inner.slab, inner.slab_size);

        if inner.owns_slab {
            let layout = alloc::Layout::from_size_align(inner.slab_size, WORD)
                .expect("layout was validated at construction");
            unsafe { alloc::dealloc(inner.slab, layout) };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_degenerate_shapes() {
        assert!(FixedPool::new(0, 4).is_err());
        assert!(FixedPool::new(64, 0).is_err());
    }

    #[test]
    fn exhaustion_and_reuse() {
        let pool = FixedPool::new(64, 2).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(matches!(
            pool.alloc(),
            Err(LockstepError::Exhausted(ResourceType::MemoryPool { .. }))
        ));

        unsafe {
            pool.free(a).unwrap();
            pool.free(b).unwrap();
        }

        let c = pool.alloc().unwrap();
        let d = pool.alloc().unwrap();
        assert!(pool.alloc().is_err());

        unsafe {
            pool.free(c).unwrap();
            pool.free(d).unwrap();
        }
    }

    #[test]
    fn slots_are_distinct_aligned_and_usable() {
        let pool = FixedPool::new(24, 8).unwrap();
        let mut addrs = Vec::new();
        for i in 0..8u8 {
            let addr = pool.alloc().unwrap();
            assert_eq!(addr.as_ptr() as usize % WORD, 0);
            unsafe {
                std::ptr::write_bytes(addr.as_ptr(), i, 24);
            }
            addrs.push(addr);
        }

        addrs.sort_by_key(|a| a.as_ptr() as usize);
        for pair in addrs.windows(2) {
            let gap = pair[1].as_ptr() as usize - pair[0].as_ptr() as usize;
            assert!(gap >= 24 + WORD, "slots overlap");
        }

        // Contents survive neighboring writes.
        for (i, addr) in addrs.iter().enumerate() {
            let first: u8 = unsafe { addr.as_ptr().read() };
            let mut buf = [0u8; 24];
            unsafe { std::ptr::copy(addr.as_ptr(), buf.as_mut_ptr(), 24) };
            assert!(buf.iter().all(|&b| b == first), "slot {} corrupted", i);
        }

        for addr in addrs {
            unsafe { pool.free(addr).unwrap() };
        }
        assert_eq!(pool.free_slots(), 8);
    }

    #[test]
    fn free_list_length_accounts_for_outstanding_allocations() {
        let pool = FixedPool::new(16, 5).unwrap();
        assert_eq!(pool.free_slots(), 5);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.free_slots(), 3);

        unsafe { pool.free(a).unwrap() };
        assert_eq!(pool.free_slots(), 4);
        unsafe { pool.free(b).unwrap() };
        assert_eq!(pool.free_slots(), 5);
    }

    #[test]
    fn churn_keeps_the_list_valid() {
        let pool = FixedPool::new(32, 4).unwrap();
        for _ in 0..4 {
            let addrs: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
            assert!(pool.alloc().is_err());
            for addr in addrs {
                unsafe { pool.free(addr).unwrap() };
            }
        }
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        let pool_a = FixedPool::new(64, 2).unwrap();
        let pool_b = FixedPool::new(64, 2).unwrap();

        let addr = pool_a.alloc().unwrap();
        match unsafe { pool_b.free(addr) } {
            Err(LockstepError::InvalidArgument(_)) => {}
            other => panic!("freeing into the wrong pool must fail, got {:?}", other),
        }
        unsafe { pool_a.free(addr).unwrap() };
    }

    #[test]
    fn nested_pool_in_a_caller_block() {
        let mut backing = vec![0usize; 64];
        let base = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let size = backing.len() * WORD;

        let pool = unsafe {
            FixedPool::from_raw_block(base, size, 16, 4, Protect::Protected).unwrap()
        };
        let addrs: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_err());
        for addr in addrs {
            unsafe { pool.free(addr).unwrap() };
        }
        drop(pool);
        // The backing memory remains the caller's.
        assert_eq!(backing.capacity(), 64);
    }

    #[test]
    fn unprotected_pool_on_one_thread() {
        let pool = unsafe { FixedPool::new_unprotected(8, 3).unwrap() };
        let a = pool.alloc().unwrap();
        unsafe { pool.free(a).unwrap() };
        assert_eq!(pool.free_slots(), 3);
    }

    #[test]
    fn pin_unpin_do_not_disturb_the_pool() {
        let pool = FixedPool::new(128, 2).unwrap();
        // Pinning may fail under a small RLIMIT_MEMLOCK; either way the
        // pool must stay usable.
        let _ = pool.pin();
        let _ = pool.unpin();
        let addr = pool.alloc().unwrap();
        unsafe { pool.free(addr).unwrap() };
    }
}
