// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::{
    error::{LockstepError, ResourceType},
    memory::{
        pin_region, unpin_region, word_round, PoolAccess, Protect, VARIABLE_POOL_MAGIC, WORD,
    },
};
use log::debug;
use std::{alloc, ptr::NonNull};

type Result<T> = crate::error::Result<T, ()>;

// A free block starts with three words: {size, prev, next}, where size is
// the total block length in bytes including these words, and prev/next
// link sibling free blocks in address order. An allocated block starts
// with two words: {owner, size}. The structure of the free list:
//
//                                  |----------------------------+
//              +---------------+   +-----+----+----+    +-----+-+--+----+
//  head ------>|size |NULL|next+-->|size |prev|next+--> |size |prev|NULL|
//              +-----+----+----+   +-----+-+--+----+    +-----+----+----+
//              |---------------------------+
const SIZE_WORD: usize = 0;
const PREV_WORD: usize = 1;
const NEXT_WORD: usize = 2;

/// Block metadata the allocator needs per allocated region.
const BLOCK_OVERHEAD: usize = 2 * WORD;

/// The smallest block that can be relinked into the free list.
const MIN_BLOCK: usize = 3 * WORD;

/// Remainders smaller than this are not worth splitting off.
const MIN_SPLIT: usize = 4 * WORD;

unsafe fn word_at(block: *mut u8, index: usize) -> usize {
    (block as *const usize).add(index).read()
}

unsafe fn set_word(block: *mut u8, index: usize, value: usize) {
    (block as *mut usize).add(index).write(value)
}

unsafe fn block_size(block: *mut u8) -> usize {
    word_at(block, SIZE_WORD)
}

unsafe fn prev_of(block: *mut u8) -> *mut u8 {
    word_at(block, PREV_WORD) as *mut u8
}

unsafe fn next_of(block: *mut u8) -> *mut u8 {
    word_at(block, NEXT_WORD) as *mut u8
}

struct FreeList {
    head: *mut u8,
}

struct VariableInner {
    magic: usize,
    slab: *mut u8,
    pool_size: usize,
    owns_slab: bool,
    free: PoolAccess<FreeList>,
}

/// A pool of variable-size blocks carved out of one contiguous region.
///
/// Free blocks form a doubly-linked list kept sorted by start address,
/// with the link words embedded in the blocks themselves. Allocation is
/// first-fit: the block is carved from the high end of the first fit,
/// leaving the low remainder in place on the list, or consumed whole when
/// the remainder would be too small to relink. Freeing reinserts the
/// block in address order and merges it with whichever neighbors it
/// touches, so two adjacent free blocks never exist.
///
/// Returned addresses are word-aligned, carry a `{owner, size}` header
/// just below them for the integrity check in [`free`], and stay valid
/// until freed or the pool is dropped.
///
/// # Examples
///
/// ```
/// use lockstep::memory::VariablePool;
///
/// let pool = VariablePool::new(4096).unwrap();
/// let addr = pool.alloc(100).unwrap();
/// unsafe {
///     addr.as_ptr().write_bytes(0, 100);
///     pool.free(addr).unwrap();
/// }
/// ```
///
/// [`free`]: VariablePool::free
pub struct VariablePool {
    inner: Box<VariableInner>,
}

// Same contract as FixedPool: the unprotected flavor is unsafe to build
// and confined to one thread by its caller.
unsafe impl Send for VariablePool {}
unsafe impl Sync for VariablePool {}

impl std::fmt::Debug for VariablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariablePool")
            .field("pool_size", &self.inner.pool_size)
            .field("free", &self.inner.free)
            .finish()
    }
}

impl VariablePool {
    /// Creates a mutex-protected pool able to satisfy a single
    /// allocation of up to `size` bytes, allocating the region from the
    /// global allocator. The region obtained is `size` plus the per-block
    /// overhead.
    pub fn new(size: usize) -> Result<VariablePool> {
        Self::build(size_to_total(size)?, Protect::Protected, None)
    }

    /// Creates a pool without internal locking.
    ///
    /// # Safety
    ///
    /// The caller must confine the pool to a single thread: every
    /// [`alloc`] and [`free`] must happen on the thread that created it.
    ///
    /// [`alloc`]: VariablePool::alloc
    /// [`free`]: VariablePool::free
    pub unsafe fn new_unprotected(size: usize) -> Result<VariablePool> {
        Self::build(size_to_total(size)?, Protect::Unprotected, None)
    }

    /// Creates a pool inside a caller-provided block of memory. The pool
    /// will not release the block on drop.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes,
    /// word-aligned, and must outlive the pool. For
    /// `Protect::Unprotected` the single-thread contract of
    /// [`new_unprotected`] applies as well.
    ///
    /// [`new_unprotected`]: VariablePool::new_unprotected
    pub unsafe fn from_raw_block(
        base: NonNull<u8>,
        size: usize,
        protect: Protect,
    ) -> Result<VariablePool> {
        if base.as_ptr() as usize % WORD != 0 || size % WORD != 0 {
            return Err(LockstepError::InvalidArgument(
                "pool block must be word-aligned and a word multiple",
            ));
        }
        if size < MIN_BLOCK {
            return Err(LockstepError::InvalidArgument(
                "pool block cannot hold a single free block",
            ));
        }

        Self::build(size, protect, Some(base))
    }

    fn build(
        total: usize,
        protect: Protect,
        block: Option<NonNull<u8>>,
    ) -> Result<VariablePool> {
        let (slab, owns_slab) = match block {
            Some(base) => (base.as_ptr(), false),
            None => {
                let layout = alloc::Layout::from_size_align(total, WORD)
                    .map_err(|_| LockstepError::InvalidArgument("pool size overflows"))?;
                let slab = unsafe { alloc::alloc(layout) };
                if slab.is_null() {
                    return Err(LockstepError::Exhausted(ResourceType::MemoryPool {
                        requested: total,
                    }));
                }
                (slab, true)
            }
        };

        // The whole region starts as one free block.
        unsafe {
            set_word(slab, SIZE_WORD, total);
            set_word(slab, PREV_WORD, 0);
            set_word(slab, NEXT_WORD, 0);
        }

        debug!("variable pool created: {} bytes", total);

        Ok(VariablePool {
            inner: Box::new(VariableInner {
                magic: VARIABLE_POOL_MAGIC,
                slab,
                pool_size: total,
                owns_slab,
                free: PoolAccess::new(protect, FreeList { head: slab }),
            }),
        })
    }

    /// Allocates `n` bytes, returning the address of the first byte.
    ///
    /// Fails with `Exhausted` when no free block is large enough. The
    /// memory is uninitialized.
    pub fn alloc(&self, n: usize) -> Result<NonNull<u8>> {
        if n == 0 {
            return Err(LockstepError::InvalidArgument(
                "allocation size must be positive",
            ));
        }

        let inner = &*self.inner;
        let owner = inner as *const VariableInner as usize;

        // Room for the header, and never smaller than what a freed block
        // needs to be relinked into the list.
        let need = match n.checked_add(WORD - 1 + BLOCK_OVERHEAD) {
            Some(_) => (word_round(n) + BLOCK_OVERHEAD).max(MIN_BLOCK),
            None => {
                return Err(LockstepError::Exhausted(ResourceType::MemoryPool {
                    requested: n,
                }))
            }
        };

        inner.free.with(|list| unsafe {
            // First fit.
            let mut block = list.head;
            while !block.is_null() && block_size(block) < need {
                block = next_of(block);
            }
            if block.is_null() {
                return Err(LockstepError::Exhausted(ResourceType::MemoryPool {
                    requested: n,
                }));
            }

            let size = block_size(block);
            let (start, taken) = if size - need < MIN_SPLIT {
                // The remainder could not be relinked; send the whole
                // block along with the allocation.
                unlink(list, block);
                (block, size)
            } else {
                // Carve from the high end. The low remainder keeps its
                // place in the list, only its size shrinks.
                set_word(block, SIZE_WORD, size - need);
                (block.add(size - need), need)
            };

            set_word(start, 0, owner);
            set_word(start, 1, taken);
            Ok(NonNull::new_unchecked(start.add(BLOCK_OVERHEAD)))
        })
    }

    /// Returns a block to the pool and merges it with any free neighbor.
    ///
    /// Fails with `InvalidArgument` when the header words before `addr`
    /// do not identify this pool.
    ///
    /// # Safety
    ///
    /// `addr` must have been returned by [`alloc`] on some pool and not
    /// freed since; the block must no longer be referenced.
    ///
    /// [`alloc`]: VariablePool::alloc
    pub unsafe fn free(&self, addr: NonNull<u8>) -> Result<()> {
        let inner = &*self.inner;
        let block = addr.as_ptr().sub(BLOCK_OVERHEAD);

        // The two words before the user address recover the owning pool
        // and the block boundary.
        let owner = word_at(block, 0);
        let size = word_at(block, 1);
        if owner != inner as *const VariableInner as usize
            || inner.magic != VARIABLE_POOL_MAGIC
        {
            return Err(LockstepError::InvalidArgument(
                "address was not allocated from this pool",
            ));
        }

        inner.free.with(|list| unsafe {
            set_word(block, SIZE_WORD, size);
            insert_sorted(list, block);
            coalesce_neighbors(block);
        });
        Ok(())
    }

    /// Locks the region's pages into physical memory. Silently succeeds
    /// on platforms without such a call.
    pub fn pin(&self) -> Result<()> {
        pin_region(self.inner.slab, self.inner.pool_size)?;
        Ok(())
    }

    /// Unlocks the region's pages.
    pub fn unpin(&self) -> Result<()> {
        unpin_region(self.inner.slab, self.inner.pool_size)?;
        Ok(())
    }

    /// Total size of the managed region in bytes, metadata included.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Offset and size of every free block, in address order. Test and
    /// diagnostics aid.
    #[cfg(test)]
    fn free_blocks(&self) -> Vec<(usize, usize)> {
        let slab = self.inner.slab as usize;
        self.inner.free.with(|list| {
            let mut blocks = Vec::new();
            let mut block = list.head;
            while !block.is_null() {
                unsafe {
                    blocks.push((block as usize - slab, block_size(block)));
                    block = next_of(block);
                }
            }
            blocks
        })
    }
}

impl Drop for VariablePool {
    fn drop(&mut self) {
        let inner = &mut *self.inner;
        inner.magic = 0;

        let _ = unpin_region(inner.slab, inner.pool_size);

        if inner.owns_slab {
            let layout = alloc::Layout::from_size_align(inner.pool_size, WORD)
                .expect("layout was validated at construction");
            unsafe { alloc::dealloc(inner.slab, layout) };
        }
    }
}

fn size_to_total(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(LockstepError::InvalidArgument("pool size must be positive"));
    }
    // Pad by the per-block overhead so one allocation of the full
    // requested size fits, and keep everything word-granular.
    size.checked_add(WORD - 1 + BLOCK_OVERHEAD)
        .map(|_| word_round(size) + BLOCK_OVERHEAD)
        .ok_or(LockstepError::InvalidArgument("pool size overflows"))
}

/// Removes `block` from the free list.
unsafe fn unlink(list: &mut FreeList, block: *mut u8) {
    let prev = prev_of(block);
    let next = next_of(block);

    if prev.is_null() {
        list.head = next;
    } else {
        set_word(prev, NEXT_WORD, next as usize);
    }
    if !next.is_null() {
        set_word(next, PREV_WORD, prev as usize);
    }
}

/// Inserts `block` into the address-ordered free list. The block's size
/// word must already be set; its links are overwritten.
unsafe fn insert_sorted(list: &mut FreeList, block: *mut u8) {
    if list.head.is_null() {
        set_word(block, PREV_WORD, 0);
        set_word(block, NEXT_WORD, 0);
        list.head = block;
        return;
    }

    if block < list.head {
        // Smaller than every free block: displace the head.
        set_word(block, PREV_WORD, 0);
        set_word(block, NEXT_WORD, list.head as usize);
        set_word(list.head, PREV_WORD, block as usize);
        list.head = block;
        return;
    }

    // Walk to the last node below the block and splice in after it.
    let mut node = list.head;
    while !next_of(node).is_null() && next_of(node) < block {
        node = next_of(node);
    }

    let next = next_of(node);
    set_word(node, NEXT_WORD, block as usize);
    set_word(block, PREV_WORD, node as usize);
    set_word(block, NEXT_WORD, next as usize);
    if !next.is_null() {
        set_word(next, PREV_WORD, block as usize);
    }
}

/// Merges `block` with its successor and predecessor where they abut it,
/// keeping the list sorted and free of adjacent blocks. The head never
/// moves here: merging into the predecessor keeps the predecessor.
unsafe fn coalesce_neighbors(block: *mut u8) {
    let next = next_of(block);
    if !next.is_null() && block.add(block_size(block)) == next {
        set_word(block, SIZE_WORD, block_size(block) + block_size(next));
        let after = next_of(next);
        set_word(block, NEXT_WORD, after as usize);
        if !after.is_null() {
            set_word(after, PREV_WORD, block as usize);
        }
    }

    let prev = prev_of(block);
    if !prev.is_null() && prev.add(block_size(prev)) == block {
        set_word(prev, SIZE_WORD, block_size(prev) + block_size(block));
        let after = next_of(block);
        set_word(prev, NEXT_WORD, after as usize);
        if !after.is_null() {
            set_word(after, PREV_WORD, prev as usize);
        }
    }
}
