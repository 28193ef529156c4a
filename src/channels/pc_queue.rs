// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::{
    error::{LockstepError, ResourceType},
    memory::FixedPool,
    sync::Semaphore,
};
use log::debug;
use parking_lot::Mutex;
use std::{mem, ptr, ptr::NonNull, time::Duration};

type Result<R, T> = crate::error::Result<R, T>;

struct Node<T> {
    data: T,
    prev: *mut Node<T>,
    next: *mut Node<T>,
}

struct Links<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// Built from the primitives underneath it: a `space_avail` semaphore
/// counting free capacity, an `items_avail` semaphore counting queued
/// elements, one mutex around the doubly-linked node list, and a
/// [`FixedPool`] holding exactly `capacity` nodes so steady-state
/// operation never touches the global allocator.
///
/// [`enqueue`] blocks while the queue is full and [`dequeue`] blocks
/// while it is empty; both have deadline-bounded variants. FIFO order is
/// strict: an element enqueued before another is dequeued before it.
///
/// # Examples
///
/// ```
/// use lockstep::channels::PcQueue;
///
/// let queue = PcQueue::new(3).unwrap();
/// queue.enqueue(1).unwrap();
/// queue.enqueue(2).unwrap();
/// assert_eq!(queue.dequeue().unwrap(), 1);
/// assert_eq!(queue.dequeue().unwrap(), 2);
/// ```
///
/// [`enqueue`]: PcQueue::enqueue
/// [`dequeue`]: PcQueue::dequeue
pub struct PcQueue<T> {
    space_avail: Semaphore,
    items_avail: Semaphore,
    links: Mutex<Links<T>>,
    pool: FixedPool,
    capacity: usize,
}

// The raw node links are fully mutex-protected; elements cross threads,
// hence T: Send.
unsafe impl<T: Send> Send for PcQueue<T> {}
unsafe impl<T: Send> Sync for PcQueue<T> {}

impl<T> std::fmt::Debug for PcQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> PcQueue<T> {
    /// Creates a queue holding at most `capacity` elements, allocating
    /// all node storage up front.
    pub fn new(capacity: usize) -> Result<PcQueue<T>, T> {
        if capacity == 0 {
            return Err(LockstepError::InvalidArgument(
                "queue capacity must be at least 1",
            ));
        }
        // Node addresses come from the pool, which hands out word-aligned
        // slots.
        if mem::align_of::<Node<T>>() > mem::size_of::<usize>() {
            return Err(LockstepError::InvalidArgument(
                "element alignment exceeds the word the node pool guarantees",
            ));
        }

        // Capacity units to hand to producers; the items side starts
        // drained since semaphore construction requires a positive
        // maximum.
        let space_avail = Semaphore::new(capacity as i64).map_err(plain)?;
        let items_avail = Semaphore::new(capacity as i64).map_err(plain)?;
        items_avail.down(capacity as i64).map_err(plain)?;

        let pool = FixedPool::new(mem::size_of::<Node<T>>(), capacity).map_err(plain)?;

        Ok(PcQueue {
            space_avail,
            items_avail,
            links: Mutex::new(Links {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
            pool,
            capacity,
        })
    }

    /// Adds `item` at the tail, blocking while the queue is full.
    ///
    /// When the queue is closed the item comes back inside the error:
    /// `Closed(Queue(Some(item)))`.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        if let Err(err) = self.space_avail.down(1) {
            return Err(carry(err, Some(item)));
        }
        self.push(item)
    }

    /// Adds `item` at the tail, giving up with `TimedOut` once `timeout`
    /// is exhausted waiting for capacity.
    ///
    /// The deadline bounds only the capacity wait. Once capacity is
    /// granted the remaining steps contend only on mutexes that are
    /// never held across a blocking wait, so they cannot stall for
    /// user-observable time. On timeout the item comes back inside the
    /// error.
    pub fn timed_enqueue(&self, item: T, timeout: Duration) -> Result<(), T> {
        if let Err(err) = self.space_avail.timed_down(1, timeout) {
            return Err(carry(err, Some(item)));
        }
        self.push(item)
    }

    /// Removes and returns the head element, blocking while the queue is
    /// empty.
    pub fn dequeue(&self) -> Result<T, T> {
        self.items_avail.down(1).map_err(|e| carry(e, None))?;
        self.pop()
    }

    /// Removes and returns the head element, giving up with `TimedOut`
    /// once `timeout` is exhausted waiting for an element. The deadline
    /// bounds only that wait, as with [`timed_enqueue`].
    ///
    /// [`timed_enqueue`]: PcQueue::timed_enqueue
    pub fn timed_dequeue(&self, timeout: Duration) -> Result<T, T> {
        self.items_avail
            .timed_down(1, timeout)
            .map_err(|e| carry(e, None))?;
        self.pop()
    }

    /// Closes the queue.
    ///
    /// Blocked producers wake with `Closed` carrying their item back;
    /// blocked consumers wake with `Closed`. Later calls fail the same
    /// way. Elements still queued are dropped with the queue.
    pub fn close(&self) {
        debug!("queue closing");
        self.space_avail.close();
        self.items_avail.close();
    }

    /// The maximum number of queued elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A snapshot of the number of queued elements. Exact only at
    /// quiescent points.
    pub fn len(&self) -> usize {
        self.items_avail.available().max(0) as usize
    }

    /// Whether the queue currently holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, item: T) -> Result<(), T> {
        // Cannot fail while the capacity semaphore is honest: at most
        // `capacity` producers hold a unit, and the pool has that many
        // nodes.
        let node = self
            .pool
            .alloc()
            .expect("node pool sized to the capacity semaphore")
            .cast::<Node<T>>()
            .as_ptr();

        unsafe {
            node.write(Node {
                data: item,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });

            let mut links = self.links.lock();
            (*node).prev = links.tail;
            if links.tail.is_null() {
                links.head = node;
            } else {
                (*links.tail).next = node;
            }
            links.tail = node;
        }

        self.items_avail.up(1).map_err(|e| carry(e, None))
    }

    fn pop(&self) -> Result<T, T> {
        let node = {
            let mut links = self.links.lock();
            let node = links.head;
            debug_assert!(!node.is_null(), "items semaphore admitted an empty queue");

            unsafe {
                links.head = (*node).next;
                if links.head.is_null() {
                    links.tail = ptr::null_mut();
                } else {
                    (*links.head).prev = ptr::null_mut();
                }
            }
            node
        };

        let data = unsafe { ptr::read(&(*node).data) };
        unsafe {
            self.pool
                .free(NonNull::new_unchecked(node as *mut u8))
                .expect("queue nodes always belong to the queue pool");
        }

        self.space_avail.up(1).map_err(|e| carry(e, None))?;
        Ok(data)
    }
}

impl<T> Drop for PcQueue<T> {
    fn drop(&mut self) {
        // Run destructors for whatever is still queued; the node memory
        // itself goes away with the pool.
        let mut node = self.links.get_mut().head;
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                ptr::drop_in_place(&mut (*node).data);
                node = next;
            }
        }
    }
}

/// Rebrands a semaphore error as a queue error, carrying `item` back to
/// the caller where there is one.
fn carry<T>(err: LockstepError<()>, item: Option<T>) -> LockstepError<T> {
    match err {
        LockstepError::Closed(_) => LockstepError::Closed(ResourceType::Queue(item)),
        LockstepError::TimedOut(_) => LockstepError::TimedOut(ResourceType::Queue(item)),
        LockstepError::WouldBlock(_) => LockstepError::WouldBlock(ResourceType::Queue(item)),
        LockstepError::Exhausted(_) => LockstepError::Exhausted(ResourceType::Queue(item)),
        LockstepError::InvalidArgument(msg) => LockstepError::InvalidArgument(msg),
        LockstepError::IoError(io_err) => LockstepError::IoError(io_err),
        LockstepError::TaskPanicked => LockstepError::TaskPanicked,
    }
}

/// For construction-time failures that never carry an element.
fn plain<T>(err: LockstepError<()>) -> LockstepError<T> {
    carry(err, None)
}
