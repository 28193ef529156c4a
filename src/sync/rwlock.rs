// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Reader-writer lock with timed acquires.
//!
//! Provides functionality similar to [`std::sync::RwLock`] except that the
//! lock cannot be poisoned and both acquires come in a deadline-bounded
//! variant.

use crate::{
    error::{LockstepError, ResourceType},
    timer::Deadline,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    cell::UnsafeCell,
    fmt::{self, Debug},
    ops::{Deref, DerefMut},
    time::Duration,
};

type Result<T> = crate::error::Result<T, ()>;

/// The whole lock discipline lives in one signed counter: zero means the
/// lock is free, a positive value counts the readers holding it, and -1
/// means exactly one writer holds it. No other value is reachable.
#[derive(Debug)]
struct LockState {
    v: i64,
}

/// A reader-writer lock over a signed holder counter.
///
/// Any number of readers may hold the lock as long as no writer does; a
/// writer excludes everyone. Acquires return RAII guards which release on
/// drop, so no release path can leave the internal mutex or the counter
/// behind: the counter is always either -1 or the live reader count.
///
/// Waiters of both kinds share one condition variable. Releasing the
/// writer wakes all of them so a cohort of queued readers enters at once;
/// releasing the last reader wakes one.
///
/// No starvation policy is promised beyond what the condition variable
/// provides.
///
/// # Examples
///
/// ```
/// use lockstep::sync::RwLock;
///
/// let lock = RwLock::new(5);
///
/// // many reader locks can be held at once
/// {
///     let r1 = lock.read();
///     let r2 = lock.read();
///     assert_eq!(*r1 + *r2, 10);
/// } // read locks are dropped at this point
///
/// // only one write lock may be held, however
/// {
///     let mut w = lock.write();
///     *w += 1;
///     assert_eq!(*w, 6);
/// } // write lock is dropped here
/// ```
pub struct RwLock<T> {
    state: Mutex<LockState>,
    cvar: Condvar,
    value: UnsafeCell<T>,
}

// Read guards hand out &T concurrently, so T must be Sync for the lock to
// be shared; the counter itself is fully mutex-protected.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T: Debug> Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Ok(guard) => d.field("data", &&*guard),
            Err(_) => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> RwLock<T> {
    /// Creates a new lock protecting `value`.
    pub fn new(value: T) -> RwLock<T> {
        RwLock {
            state: Mutex::new(LockState { v: 0 }),
            cvar: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Returns a mutable reference to the protected value.
    ///
    /// No locking takes place: the exclusive borrow proves no guard is
    /// alive.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Acquires shared access, blocking while a writer holds the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.v < 0 {
            self.cvar.wait(&mut state);
        }
        state.v += 1;
        RwLockReadGuard { lock: self }
    }

    /// Acquires exclusive access, blocking while anyone holds the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut state = self.state.lock();
        while state.v != 0 {
            self.cvar.wait(&mut state);
        }
        state.v = -1;
        RwLockWriteGuard { lock: self }
    }

    /// Acquires shared access if no writer holds the lock, without
    /// blocking.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.v < 0 {
            return Err(LockstepError::WouldBlock(ResourceType::RwLock));
        }
        state.v += 1;
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquires exclusive access if the lock is free, without blocking.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.v != 0 {
            return Err(LockstepError::WouldBlock(ResourceType::RwLock));
        }
        state.v = -1;
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Acquires shared access, giving up with `TimedOut` once `timeout`
    /// is exhausted.
    ///
    /// The budget covers the internal mutex acquisition and every
    /// condition wait; on timeout the counter is untouched.
    pub fn read_timeout(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, T>> {
        let deadline = check_timeout(timeout)?;
        let mut state = self.lock_until(deadline)?;
        while state.v < 0 {
            self.wait_until(&mut state, deadline)?;
        }
        state.v += 1;
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquires exclusive access, giving up with `TimedOut` once
    /// `timeout` is exhausted.
    pub fn write_timeout(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, T>> {
        let deadline = check_timeout(timeout)?;
        let mut state = self.lock_until(deadline)?;
        while state.v != 0 {
            self.wait_until(&mut state, deadline)?;
        }
        state.v = -1;
        Ok(RwLockWriteGuard { lock: self })
    }

    fn lock_until(&self, deadline: Deadline) -> Result<MutexGuard<'_, LockState>> {
        self.state
            .try_lock_until(deadline.instant())
            .ok_or(LockstepError::TimedOut(ResourceType::RwLock))
    }

    fn wait_until(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        deadline: Deadline,
    ) -> Result<()> {
        let timed_out = self.cvar.wait_until(state, deadline.instant()).timed_out();
        if timed_out || deadline.expired() {
            return Err(LockstepError::TimedOut(ResourceType::RwLock));
        }
        Ok(())
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.v > 0);
        state.v -= 1;
        let now_free = state.v == 0;
        drop(state);

        // A reader leaving only unblocks anyone once the count hits zero.
        if now_free {
            self.cvar.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.v, -1);
        state.v = 0;
        drop(state);

        // Broadcast so a cohort of queued readers all get in.
        self.cvar.notify_all();
    }
}

/// Shared access to the value inside an [`RwLock`]. Releases on drop.
#[must_use = "the lock is held only while the guard is alive"]
#[derive(Debug)]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Holding the guard keeps v > 0, so no writer exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access to the value inside an [`RwLock`]. Releases on drop.
#[must_use = "the lock is held only while the guard is alive"]
#[derive(Debug)]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Holding the guard keeps v == -1, excluding everyone else.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

fn check_timeout(timeout: Duration) -> Result<Deadline> {
    if timeout.is_zero() {
        return Err(LockstepError::InvalidArgument("timeout must be non-zero"));
    }
    Ok(Deadline::after(timeout))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use std::{sync::Arc, thread, time::Instant};

    fn holder_count<T>(lock: &RwLock<T>) -> i64 {
        lock.state.lock().v
    }

    #[test]
    fn many_readers_share_the_lock() {
        let lock = RwLock::new(5);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 5);
        assert_eq!(*r2, 5);
        assert_eq!(holder_count(&lock), 2);
        drop(r1);
        drop(r2);
        assert_eq!(holder_count(&lock), 0);
    }

    #[test]
    fn writer_excludes_everyone() {
        let lock = RwLock::new(0u32);
        let w = lock.try_write().unwrap();
        assert_eq!(holder_count(&lock), -1);

        assert!(matches!(
            lock.try_read(),
            Err(LockstepError::WouldBlock(ResourceType::RwLock))
        ));
        assert!(lock.try_write().is_err());

        drop(w);
        assert_eq!(holder_count(&lock), 0);
        lock.try_read().unwrap();
    }

    #[test]
    fn write_guard_mutates_the_value() {
        let lock = RwLock::new(5);
        {
            let mut w = lock.write();
            *w += 1;
            assert_eq!(*w, 6);
        }
        assert_eq!(*lock.read(), 6);
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    fn get_mut_bypasses_locking() {
        let mut lock = RwLock::new(1);
        *lock.get_mut() = 7;
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn write_waits_for_readers_to_leave() {
        let lock = Arc::new(RwLock::new(0u64));
        let reader = lock.read();

        let writer = thread::spawn(enclose! { (lock) move || {
            let start = Instant::now();
            let mut w = lock.write();
            *w = 1;
            start.elapsed()
        }});

        thread::sleep(Duration::from_millis(50));
        drop(reader);

        let waited = writer.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn timed_read_expires_under_a_writer() {
        let lock = RwLock::new(());
        let _w = lock.write();

        let start = Instant::now();
        match lock.read_timeout(Duration::from_millis(50)) {
            Err(LockstepError::TimedOut(ResourceType::RwLock)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(holder_count(&lock), -1);
    }

    #[test]
    fn timed_write_expires_under_a_reader() {
        let lock = RwLock::new(());
        let _r = lock.read();
        assert!(matches!(
            lock.write_timeout(Duration::from_millis(30)),
            Err(LockstepError::TimedOut(ResourceType::RwLock))
        ));
        // No writer slipped in; the counter still records one reader.
        assert_eq!(holder_count(&lock), 1);
    }

    #[test]
    fn timed_write_succeeds_once_readers_leave() {
        let lock = Arc::new(RwLock::new(()));
        let reader = lock.read();

        let writer = thread::spawn(enclose! { (lock) move || {
            lock.write_timeout(Duration::from_secs(5)).map(|_| ())
        }});

        thread::sleep(Duration::from_millis(20));
        drop(reader);
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn writer_release_admits_a_reader_cohort() {
        let lock = Arc::new(RwLock::new(()));
        let w = lock.write();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                thread::spawn(enclose! { (lock) move || {
                    let _r = lock.read_timeout(Duration::from_secs(5)).unwrap();
                    thread::sleep(Duration::from_millis(20));
                }})
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        drop(w);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(holder_count(&lock), 0);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let lock = RwLock::new(());
        assert!(matches!(
            lock.read_timeout(Duration::from_millis(0)),
            Err(LockstepError::InvalidArgument(_))
        ));
    }
}
