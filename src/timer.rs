// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Deadline arithmetic for the timed primitives.
//!
//! Every timed operation in this crate converts its relative timeout to a
//! [`Deadline`] exactly once, up front, and then re-derives the remaining
//! budget from it on every internal wakeup. A spurious wakeup therefore
//! never refreshes the budget: the wait ends no later than the instant
//! computed at the start of the call.

use std::time::{Duration, Instant};

/// An absolute point in time a bounded wait must not outlive.
///
/// # Examples
///
/// ```
/// use lockstep::timer::Deadline;
/// use std::time::Duration;
///
/// let deadline = Deadline::after(Duration::from_millis(50));
/// assert!(!deadline.expired());
/// assert!(deadline.remaining() <= Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    when: Instant,
}

impl Deadline {
    /// Computes the absolute deadline `timeout` from now, on the
    /// monotonic clock.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline {
            when: Instant::now() + timeout,
        }
    }

    /// The absolute instant this deadline falls on.
    pub fn instant(&self) -> Instant {
        self.when
    }

    /// Whether the deadline has already passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.when
    }

    /// Budget left before the deadline. Zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.when.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deadline_budget_shrinks_monotonically() {
        let deadline = Deadline::after(Duration::from_millis(200));
        let first = deadline.remaining();
        std::thread::sleep(Duration::from_millis(10));
        let second = deadline.remaining();
        assert!(second <= first);
        assert!(!deadline.expired());
    }

    #[test]
    fn zero_timeout_is_born_expired() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::from_millis(0));
    }

    #[test]
    fn instant_is_pinned_at_construction() {
        let deadline = Deadline::after(Duration::from_millis(5));
        let when = deadline.instant();
        std::thread::sleep(Duration::from_millis(10));
        // Re-reading never moves the deadline.
        assert_eq!(deadline.instant(), when);
        assert!(deadline.expired());
    }
}
