// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::{
    error::{LockstepError, ResourceType},
    timer::Deadline,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

type Result<T> = crate::error::Result<T, ()>;

#[derive(Debug)]
struct SemaphoreState {
    value: i64,
    closed: bool,
}

impl SemaphoreState {
    fn try_acquire(&mut self, units: i64) -> Result<bool> {
        if self.closed {
            return Err(LockstepError::Closed(ResourceType::Semaphore {
                requested: units,
                available: self.value,
            }));
        }

        if self.value >= units {
            self.value -= units;
            return Ok(true);
        }
        Ok(false)
    }
}

/// A counting semaphore built from a mutex and a condition variable.
///
/// The counter starts at the maximum handed to [`new`] and supports
/// multi-unit increments and decrements: [`down`] blocks until the value
/// is at least the number of units requested, which is what lets a single
/// owner drain the whole capacity in one call during shutdown.
///
/// All timed variants convert their relative timeout to an absolute
/// deadline once and charge every internal wait against it, so a wait
/// never exceeds its budget no matter how often it is woken spuriously.
///
/// # Examples
///
/// ```
/// use lockstep::sync::Semaphore;
///
/// let sem = Semaphore::new(2).unwrap();
/// sem.down(2).unwrap();
/// sem.up(1).unwrap();
/// assert_eq!(sem.available(), 1);
/// ```
///
/// [`new`]: Semaphore::new
/// [`down`]: Semaphore::down
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    cvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the specified number of units, all of
    /// them initially available.
    ///
    /// Fails with `InvalidArgument` when `max_value` is not positive.
    /// Users that need an initially-empty semaphore create it at the
    /// intended capacity and immediately [`down`] it, which is how the
    /// queue and the futures in this crate do it.
    ///
    /// [`down`]: Semaphore::down
    pub fn new(max_value: i64) -> Result<Semaphore> {
        if max_value <= 0 {
            return Err(LockstepError::InvalidArgument(
                "semaphore maximum must be positive",
            ));
        }

        Ok(Semaphore {
            state: Mutex::new(SemaphoreState {
                value: max_value,
                closed: false,
            }),
            cvar: Condvar::new(),
        })
    }

    /// Returns the number of units currently available.
    ///
    /// The value is a snapshot; another thread may change it before the
    /// caller acts on it. Meaningful at quiescent points and in tests.
    pub fn available(&self) -> i64 {
        self.state.lock().value
    }

    /// Adds `units` to the semaphore and wakes waiters. Never blocks.
    ///
    /// A single-unit release wakes one waiter. A multi-unit release wakes
    /// them all: with several waiters parked on different unit counts, a
    /// single wakeup could land on a waiter that still cannot proceed and
    /// strand one that could.
    pub fn up(&self, units: i64) -> Result<()> {
        check_units(units)?;

        let mut state = self.state.lock();
        state.value += units;
        drop(state);

        // Waiters re-check the predicate under the mutex, so signalling
        // after the unlock is safe.
        if units == 1 {
            self.cvar.notify_one();
        } else {
            self.cvar.notify_all();
        }
        Ok(())
    }

    /// Removes `units` from the semaphore, blocking until the value is
    /// large enough to allow it.
    ///
    /// Returns `Closed` if [`close`] is called before the units become
    /// available.
    ///
    /// [`close`]: Semaphore::close
    pub fn down(&self, units: i64) -> Result<()> {
        check_units(units)?;

        let mut state = self.state.lock();
        loop {
            if state.try_acquire(units)? {
                return Ok(());
            }
            self.cvar.wait(&mut state);
        }
    }

    /// Adds `delta` when positive, removes `-delta` when negative.
    /// A zero `delta` is an error.
    pub fn op(&self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Err(LockstepError::InvalidArgument("semaphore delta is zero"));
        }

        if delta > 0 {
            self.up(delta)
        } else {
            self.down(-delta)
        }
    }

    /// Like [`down`], bounded by `timeout`.
    ///
    /// The budget covers the acquisition of the internal mutex and every
    /// condition wait. When it runs out at any point the call returns
    /// `TimedOut` and the semaphore value is untouched.
    ///
    /// [`down`]: Semaphore::down
    pub fn timed_down(&self, units: i64, timeout: Duration) -> Result<()> {
        check_units(units)?;
        let deadline = check_timeout(timeout)?;

        let mut state = self.lock_until(units, deadline)?;
        loop {
            if state.try_acquire(units)? {
                return Ok(());
            }

            let timed_out = self
                .cvar
                .wait_until(&mut state, deadline.instant())
                .timed_out();
            if timed_out || deadline.expired() {
                return Err(timeout_error(units, state.value));
            }
        }
    }

    /// Like [`up`], bounded by `timeout`. Only the acquisition of the
    /// internal mutex is bounded; the increment itself never waits.
    ///
    /// [`up`]: Semaphore::up
    pub fn timed_up(&self, units: i64, timeout: Duration) -> Result<()> {
        check_units(units)?;
        let deadline = check_timeout(timeout)?;

        let mut state = self.lock_until(units, deadline)?;
        state.value += units;
        drop(state);

        if units == 1 {
            self.cvar.notify_one();
        } else {
            self.cvar.notify_all();
        }
        Ok(())
    }

    /// Timed version of [`op`].
    ///
    /// [`op`]: Semaphore::op
    pub fn timed_op(&self, delta: i64, timeout: Duration) -> Result<()> {
        if delta == 0 {
            return Err(LockstepError::InvalidArgument("semaphore delta is zero"));
        }

        if delta > 0 {
            self.timed_up(delta, timeout)
        } else {
            self.timed_down(-delta, timeout)
        }
    }

    /// Closes the semaphore.
    ///
    /// All blocked waiters wake up with `Closed`, and every later
    /// blocking operation fails the same way. Increments remain allowed
    /// so in-flight releases can complete.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);

        self.cvar.notify_all();
    }

    fn lock_until(
        &self,
        units: i64,
        deadline: Deadline,
    ) -> Result<MutexGuard<'_, SemaphoreState>> {
        match self.state.try_lock_until(deadline.instant()) {
            Some(guard) => Ok(guard),
            // The mutex is only ever held for short critical sections, so
            // this fires only when the budget was tiny to begin with. The
            // live value is unknowable without the lock; report zero.
            None => Err(timeout_error(units, 0)),
        }
    }
}

fn check_units(units: i64) -> Result<()> {
    if units < 1 {
        return Err(LockstepError::InvalidArgument(
            "semaphore units must be at least 1",
        ));
    }
    Ok(())
}

fn check_timeout(timeout: Duration) -> Result<Deadline> {
    if timeout.is_zero() {
        return Err(LockstepError::InvalidArgument("timeout must be non-zero"));
    }
    Ok(Deadline::after(timeout))
}

fn timeout_error(requested: i64, available: i64) -> LockstepError<()> {
    LockstepError::TimedOut(ResourceType::Semaphore {
        requested,
        available,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn new_rejects_non_positive_maximum() {
        assert!(Semaphore::new(0).is_err());
        assert!(Semaphore::new(-5).is_err());
    }

    #[test]
    fn up_down_accounting() {
        let sem = Semaphore::new(1).unwrap();
        sem.down(1).unwrap();
        sem.up(1).unwrap();
        sem.up(1).unwrap();
        sem.down(2).unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn op_dispatches_on_sign() {
        let sem = Semaphore::new(10).unwrap();
        sem.op(-10).unwrap();
        sem.op(3).unwrap();
        assert_eq!(sem.available(), 3);

        match sem.op(0) {
            Err(LockstepError::InvalidArgument(_)) => {}
            other => panic!("zero delta must be rejected, got {:?}", other),
        }
    }

    #[test]
    fn invalid_units_are_rejected() {
        let sem = Semaphore::new(1).unwrap();
        assert!(sem.up(0).is_err());
        assert!(sem.down(-1).is_err());
        assert!(sem.timed_down(0, Duration::from_millis(10)).is_err());
        assert!(sem.timed_down(1, Duration::from_millis(0)).is_err());
    }

    #[test]
    fn timed_down_honors_its_budget() {
        let sem = Semaphore::new(10).unwrap();
        sem.timed_op(-10, Duration::from_millis(100)).unwrap();

        let start = Instant::now();
        match sem.timed_op(-2, Duration::from_millis(150)) {
            Err(LockstepError::TimedOut(ResourceType::Semaphore {
                requested,
                available,
            })) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 0);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(150));

        assert!(matches!(
            sem.timed_op(-2, Duration::from_millis(50)),
            Err(LockstepError::TimedOut(_))
        ));

        sem.up(1).unwrap();
        sem.down(1).unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn timed_down_does_not_mutate_on_timeout() {
        let sem = Semaphore::new(3).unwrap();
        let _ = sem.timed_down(5, Duration::from_millis(30));
        assert_eq!(sem.available(), 3);
    }

    #[test]
    fn down_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        sem.down(1).unwrap();

        let waiter = thread::spawn(enclose! { (sem) move || {
            let start = Instant::now();
            sem.down(1).unwrap();
            start.elapsed()
        }});

        thread::sleep(Duration::from_millis(50));
        sem.up(1).unwrap();

        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn multi_unit_up_wakes_every_satisfiable_waiter() {
        let sem = Arc::new(Semaphore::new(2).unwrap());
        sem.down(2).unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                thread::spawn(enclose! { (sem) move || {
                    sem.timed_down(1, Duration::from_secs(5)).unwrap();
                }})
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        sem.up(2).unwrap();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn timed_down_succeeds_when_units_arrive_in_time() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        sem.down(1).unwrap();

        let releaser = thread::spawn(enclose! { (sem) move || {
            thread::sleep(Duration::from_millis(20));
            sem.up(1).unwrap();
        }});

        sem.timed_down(1, Duration::from_secs(5)).unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn close_unblocks_waiters_with_a_distinguishable_error() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        sem.down(1).unwrap();

        let waiter = thread::spawn(enclose! { (sem) move || sem.down(1) });

        thread::sleep(Duration::from_millis(30));
        sem.close();

        match waiter.join().unwrap() {
            Err(LockstepError::Closed(ResourceType::Semaphore { .. })) => {}
            other => panic!("expected closed error, got {:?}", other),
        }

        // Later blocking operations observe the same.
        assert!(matches!(
            sem.down(1),
            Err(LockstepError::Closed(ResourceType::Semaphore { .. }))
        ));
    }
}
