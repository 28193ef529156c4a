// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::error::LockstepError;
use parking_lot::{Condvar, Mutex};

type Result<T> = crate::error::Result<T, ()>;

#[derive(Debug)]
struct BarrierState {
    num_arrived: usize,
    sense: bool,
}

/// A centralized sense-reversing barrier without busy waiting.
///
/// Arrivals gather under one mutex; the last one resets the arrival
/// count, flips the sense flag and broadcasts, all before dropping the
/// mutex, so every waiter observes a consistent flipped sense. Release is
/// the flip itself rather than a counter reset, which is what makes the
/// barrier reusable for arbitrarily many rounds without a reset race.
///
/// Suited to cases where the number of threads oversubscribes the number
/// of cores, since waiters sleep on the condition variable.
///
/// # Examples
///
/// ```
/// use lockstep::{enclose, sync::Barrier};
/// use std::{sync::Arc, thread};
///
/// let barrier = Arc::new(Barrier::new(2).unwrap());
/// let peer = thread::spawn(enclose! { (barrier) move || {
///     barrier.sync();
/// }});
/// barrier.sync();
/// peer.join().unwrap();
/// ```
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    num_waiters: usize,
}

impl Barrier {
    /// Creates a barrier for `num_waiters` participating threads.
    ///
    /// Fails with `InvalidArgument` when `num_waiters` is zero.
    pub fn new(num_waiters: usize) -> Result<Barrier> {
        if num_waiters == 0 {
            return Err(LockstepError::InvalidArgument(
                "barrier needs at least one waiter",
            ));
        }

        Ok(Barrier {
            state: Mutex::new(BarrierState {
                num_arrived: 0,
                sense: false,
            }),
            cvar: Condvar::new(),
            num_waiters,
        })
    }

    /// Blocks until all `num_waiters` participants have called `sync`.
    ///
    /// Returns `true` on exactly one participant per round (the last
    /// arrival, which performed the release) and `false` on the others.
    pub fn sync(&self) -> bool {
        let mut state = self.state.lock();
        // Snapshot the sense first; the release flips the live flag away
        // from it.
        let sense = state.sense;
        state.num_arrived += 1;

        if state.num_arrived == self.num_waiters {
            state.num_arrived = 0;
            state.sense = !sense;
            self.cvar.notify_all();
            true
        } else {
            while sense == state.sense {
                self.cvar.wait(&mut state);
            }
            false
        }
    }

    /// The number of participating threads.
    pub fn num_waiters(&self) -> usize {
        self.num_waiters
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use parking_lot::Mutex as PlainMutex;
    use std::{sync::Arc, thread};

    #[test]
    fn zero_waiters_is_rejected() {
        assert!(Barrier::new(0).is_err());
    }

    #[test]
    fn single_waiter_never_blocks() {
        let barrier = Barrier::new(1).unwrap();
        for _ in 0..10 {
            assert!(barrier.sync());
        }
    }

    #[test]
    fn rounds_do_not_interleave() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 128;

        let barrier = Arc::new(Barrier::new(THREADS).unwrap());
        let log = Arc::new(PlainMutex::new(Vec::new()));

        let workers: Vec<_> = (0..THREADS)
            .map(|tid| {
                thread::spawn(enclose! { (barrier, log) move || {
                    for round in 0..ROUNDS {
                        log.lock().push((round, tid));
                        barrier.sync();
                    }
                }})
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        // Every stride of THREADS entries belongs to a single round.
        let log = log.lock();
        assert_eq!(log.len(), THREADS * ROUNDS);
        for (stride, chunk) in log.chunks(THREADS).enumerate() {
            for &(round, _) in chunk {
                assert_eq!(round, stride);
            }
        }
    }

    #[test]
    fn one_leader_per_round() {
        const THREADS: usize = 3;
        const ROUNDS: usize = 50;

        let barrier = Arc::new(Barrier::new(THREADS).unwrap());

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                thread::spawn(enclose! { (barrier) move || {
                    let mut led = 0usize;
                    for _ in 0..ROUNDS {
                        if barrier.sync() {
                            led += 1;
                        }
                    }
                    led
                }})
            })
            .collect();

        let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(total, ROUNDS);

        // All participants left; the arrival count is back at zero.
        assert_eq!(barrier.state.lock().num_arrived, 0);
    }
}
