// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! A pool of worker threads consuming submitted callbacks.
//!
//! [`ThreadPool`] owns a set of OS threads. Each submission through
//! [`execute`] picks an idle worker (growing the pool when it is
//! [`Elastic`] and below its ceiling), hands it the callback and returns
//! a [`TaskFuture`] that the caller joins for the callback's result.
//!
//! Dispatch is driven entirely by the crate's own semaphores: a
//! `free_workers` counter gates submissions on worker availability, each
//! worker parks on its private `work_available` semaphore, and every
//! future is a semaphore that starts empty and is signalled exactly once.
//!
//! [`execute`]: ThreadPool::execute
//! [`Elastic`]: PoolKind::Elastic

use crate::{
    error::{LockstepError, ResourceType},
    sync::Semaphore,
};
use log::{debug, trace};
use parking_lot::Mutex;
use std::{
    any::Any,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread,
};

type Result<T> = crate::error::Result<T, ()>;

/// Growth policy of a [`ThreadPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// All workers are spawned up front and the pool never grows.
    Fixed,
    /// The pool starts at its minimum and spawns workers on demand up to
    /// its maximum.
    Elastic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Uninitialized,
    Available,
    Unavailable,
}

type BoxedResult = Box<dyn Any + Send>;
type Callback = Box<dyn FnOnce() -> BoxedResult + Send>;

struct WorkItem {
    callback: Callback,
    future: Arc<FutureState>,
}

/// One-shot mailbox between the worker executing a callback and the
/// caller joining on it. The semaphore starts drained; the worker
/// signals it exactly once when the result lands.
struct FutureState {
    result_available: Semaphore,
    result: Mutex<Option<thread::Result<BoxedResult>>>,
}

impl FutureState {
    fn new() -> Result<Arc<FutureState>> {
        let result_available = Semaphore::new(1)?;
        result_available.down(1)?;
        Ok(Arc::new(FutureState {
            result_available,
            result: Mutex::new(None),
        }))
    }
}

/// The pending result of a callback submitted to a [`ThreadPool`].
///
/// Exactly one join happens per future, enforced by [`join`] consuming
/// `self`. Dropping the future without joining abandons the result; the
/// worker is unaffected.
///
/// [`join`]: TaskFuture::join
#[must_use = "a future does nothing unless joined"]
pub struct TaskFuture<T> {
    state: Arc<FutureState>,
    _result: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("ready", &(self.state.result_available.available() > 0))
            .finish()
    }
}

impl<T: Send + 'static> TaskFuture<T> {
    /// Blocks until the worker stores the callback's result, then
    /// returns it.
    ///
    /// A callback that panicked surfaces as `TaskPanicked`.
    pub fn join(self) -> Result<T> {
        self.state.result_available.down(1)?;

        let result = self
            .state
            .result
            .lock()
            .take()
            .expect("a signalled future always carries a result");
        match result {
            Ok(boxed) => Ok(*boxed
                .downcast::<T>()
                .expect("future result type is pinned at submission")),
            Err(_) => Err(LockstepError::TaskPanicked),
        }
    }
}

struct WorkerShared {
    index: usize,
    work_available: Semaphore,
    slot: Mutex<Option<WorkItem>>,
}

struct WorkerHandle {
    shared: Arc<WorkerShared>,
    join: Option<thread::JoinHandle<()>>,
}

struct Roster {
    availability: Vec<Availability>,
    workers: Vec<Option<WorkerHandle>>,
    num_alive: usize,
}

impl Roster {
    fn first_available(&self) -> Option<usize> {
        self.availability[..self.num_alive]
            .iter()
            .position(|&a| a == Availability::Available)
    }
}

struct PoolInner {
    kind: PoolKind,
    max_threads: usize,
    /// Counts workers not currently running a callback. Submissions
    /// take a unit before touching the roster, so holding a unit means
    /// an idle worker exists or there is room to grow one.
    free_workers: Semaphore,
    roster: Mutex<Roster>,
}

/// A fixed or elastic pool of worker threads with per-submission
/// futures.
///
/// Dropping the pool is its shutdown: the drop waits for every in-flight
/// callback to finish, tells each worker to exit and joins its thread.
///
/// # Examples
///
/// ```
/// use lockstep::executor::ThreadPool;
///
/// let pool = ThreadPool::fixed(2).unwrap();
/// let future = pool.execute(|| 6 * 7).unwrap();
/// assert_eq!(future.join().unwrap(), 42);
/// ```
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("kind", &self.inner.kind)
            .field("max_threads", &self.inner.max_threads)
            .field("num_alive", &self.inner.roster.lock().num_alive)
            .finish()
    }
}

impl ThreadPool {
    /// Creates a pool with `min_threads` workers spawned up front and
    /// room for `max_threads`.
    ///
    /// Requires `0 < min_threads <= max_threads`, and for
    /// [`PoolKind::Fixed`] that `min_threads == max_threads`.
    pub fn new(min_threads: usize, max_threads: usize, kind: PoolKind) -> Result<ThreadPool> {
        if min_threads == 0 || min_threads > max_threads {
            return Err(LockstepError::InvalidArgument(
                "pool requires 0 < min_threads <= max_threads",
            ));
        }
        if kind == PoolKind::Fixed && min_threads != max_threads {
            return Err(LockstepError::InvalidArgument(
                "fixed pools require min_threads == max_threads",
            ));
        }

        let inner = Arc::new(PoolInner {
            kind,
            max_threads,
            free_workers: Semaphore::new(max_threads as i64)?,
            roster: Mutex::new(Roster {
                availability: vec![Availability::Uninitialized; max_threads],
                workers: (0..max_threads).map(|_| None).collect(),
                num_alive: 0,
            }),
        });

        let pool = ThreadPool { inner };
        for _ in 0..min_threads {
            let mut roster = pool.inner.roster.lock();
            if let Err(err) = add_worker(&pool.inner, &mut roster) {
                drop(roster);
                // The drop joins whatever was spawned so far.
                return Err(err);
            }
        }

        debug!(
            "thread pool up: {:?}, {} of {} workers",
            kind, min_threads, max_threads
        );
        Ok(pool)
    }

    /// A pool of exactly `threads` workers.
    pub fn fixed(threads: usize) -> Result<ThreadPool> {
        Self::new(threads, threads, PoolKind::Fixed)
    }

    /// A pool that grows on demand from `min_threads` to `max_threads`.
    pub fn elastic(min_threads: usize, max_threads: usize) -> Result<ThreadPool> {
        Self::new(min_threads, max_threads, PoolKind::Elastic)
    }

    /// Hands `callback` to an idle worker and returns the future of its
    /// result.
    ///
    /// Blocks while every worker is busy and the pool cannot grow. An
    /// [`Elastic`] pool below its ceiling spawns a new worker instead of
    /// waiting; a spawn failure aborts the submission and surfaces the
    /// underlying error with the pool state rolled back.
    ///
    /// [`Elastic`]: PoolKind::Elastic
    pub fn execute<F, T>(&self, callback: F) -> Result<TaskFuture<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let future = FutureState::new()?;
        let item = WorkItem {
            callback: Box::new(move || Box::new(callback()) as BoxedResult),
            future: Arc::clone(&future),
        };

        // Wait for the right to use a worker.
        self.inner.free_workers.down(1)?;
        // Give the unit back unless the dispatch below goes through.
        let unit = scopeguard::guard((), |()| {
            let _ = self.inner.free_workers.up(1);
        });

        let shared = {
            let mut roster = self.inner.roster.lock();
            let index = match roster.first_available() {
                Some(index) => index,
                // Holding a unit with nobody available means this pool is
                // elastic with room to grow.
                None => add_worker(&self.inner, &mut roster)?,
            };
            roster.availability[index] = Availability::Unavailable;
            Arc::clone(
                &roster.workers[index]
                    .as_ref()
                    .expect("live roster entries are populated")
                    .shared,
            )
        };

        *shared.slot.lock() = Some(item);
        shared.work_available.up(1)?;
        scopeguard::ScopeGuard::into_inner(unit);

        Ok(TaskFuture {
            state: future,
            _result: PhantomData,
        })
    }

    /// The number of workers currently spawned.
    pub fn live_workers(&self) -> usize {
        self.inner.roster.lock().num_alive
    }

    /// The ceiling on the number of workers.
    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        debug!("thread pool shutting down");

        // Draining the whole capacity waits for every in-flight callback
        // and leaves nothing for concurrent submissions to take.
        for _ in 0..self.inner.max_threads {
            if self.inner.free_workers.down(1).is_err() {
                break;
            }
        }

        let workers: Vec<WorkerHandle> = {
            let mut roster = self.inner.roster.lock();
            roster.workers.iter_mut().filter_map(Option::take).collect()
        };

        for mut worker in workers {
            // An empty slot is the shutdown message.
            *worker.shared.slot.lock() = None;
            let _ = worker.shared.work_available.up(1);
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

/// Spawns one more worker and records it in the roster. Caller holds the
/// roster lock, which serializes index assignment.
fn add_worker(inner: &Arc<PoolInner>, roster: &mut Roster) -> Result<usize> {
    if roster.num_alive >= inner.max_threads {
        return Err(LockstepError::Exhausted(ResourceType::ThreadPool));
    }

    let index = roster.num_alive;
    let work_available = Semaphore::new(1)?;
    work_available.down(1)?;

    let shared = Arc::new(WorkerShared {
        index,
        work_available,
        slot: Mutex::new(None),
    });

    // The worker must never keep the pool alive on its own.
    let pool = Arc::downgrade(inner);
    let worker_shared = Arc::clone(&shared);
    let join = thread::Builder::new()
        .name(format!("lockstep-worker-{}", index))
        .spawn(move || worker_loop(pool, worker_shared))
        .map_err(LockstepError::IoError)?;

    roster.num_alive += 1;
    roster.workers[index] = Some(WorkerHandle {
        shared,
        join: Some(join),
    });
    roster.availability[index] = Availability::Available;

    trace!("worker {} spawned", index);
    Ok(index)
}

fn worker_loop(pool: Weak<PoolInner>, shared: Arc<WorkerShared>) {
    loop {
        if shared.work_available.down(1).is_err() {
            break;
        }

        let item = shared.slot.lock().take();
        let item = match item {
            Some(item) => item,
            // The empty slot tells the worker to exit cleanly.
            None => {
                trace!("worker {} exiting", shared.index);
                break;
            }
        };

        // Contain panics: the callback is user code, and the roster and
        // the future must stay consistent either way.
        let result = panic::catch_unwind(AssertUnwindSafe(item.callback));
        *item.future.result.lock() = Some(result);
        // One-unit up on a private semaphore cannot fail.
        let _ = item.future.result_available.up(1);

        let pool = match pool.upgrade() {
            Some(pool) => pool,
            None => break,
        };
        pool.roster.lock().availability[shared.index] = Availability::Available;
        let _ = pool.free_workers.up(1);
    }
}
