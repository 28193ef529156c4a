// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use std::{
    fmt::{self, Debug},
    io,
};
use thiserror::Error;

/// Result type alias that all lockstep public API functions can use.
pub type Result<T, V> = std::result::Result<T, LockstepError<V>>;

/// Resource a failed operation was acting on, with extra diagnostic data
/// for richer error messages.
#[derive(Debug)]
pub enum ResourceType<T> {
    /// Semaphore resource that includes the requested and available units
    /// as debugging metadata.
    Semaphore {
        /// Requested units
        requested: i64,
        /// Available semaphore units
        available: i64,
    },

    /// Reader/writer lock
    RwLock,

    /// Memory pool. `requested` is the user request in bytes (or one
    /// object for a fixed pool).
    MemoryPool {
        /// Requested allocation size in bytes
        requested: usize,
    },

    /// Producer/consumer queue. Carries the rejected element back to the
    /// producer when an enqueue fails against a closed queue.
    Queue(Option<T>),

    /// Worker thread pool
    ThreadPool,
}

impl<T> fmt::Display for ResourceType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Semaphore {
                requested,
                available,
            } => write!(
                f,
                "Semaphore (requested {} but only {} available)",
                requested, available
            ),
            ResourceType::RwLock => f.write_str("RwLock"),
            ResourceType::MemoryPool { requested } => {
                write!(f, "Memory pool (requested {} bytes)", requested)
            }
            ResourceType::Queue(_) => f.write_str("Queue"),
            ResourceType::ThreadPool => f.write_str("Thread pool"),
        }
    }
}

/// Composite error type to encompass all error types lockstep produces.
#[derive(Error)]
pub enum LockstepError<T> {
    /// IO error from platform calls (thread spawn, page pinning)
    #[error("IO error occurred: {0}")]
    IoError(#[from] io::Error),

    /// An argument failed validation before any state was touched
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The resource in question is closed. Generic because the queue
    /// variant needs to return the actual item handed to `enqueue`.
    #[error("{0} is closed")]
    Closed(ResourceType<T>),

    /// A non-blocking acquire could not proceed without suspending.
    #[error("{0} would block")]
    WouldBlock(ResourceType<T>),

    /// A bounded wait exhausted its budget. The resource state is
    /// exactly as it was before the call.
    #[error("{0} timed out")]
    TimedOut(ResourceType<T>),

    /// A pool had no free slot or no block large enough.
    #[error("{0} is exhausted")]
    Exhausted(ResourceType<T>),

    /// A worker callback panicked; the panic was contained by the worker
    /// and surfaces at the join.
    #[error("task panicked before producing a result")]
    TaskPanicked,
}

#[doc(hidden)]
/// This `Debug` implementation is required, otherwise we'd be required to
/// place a bound on the generic `T` in LockstepError. This causes the
/// `Debug` constraint to be forced onto users of the type, and it's an
/// annoying burden on the type. This gets around that.
impl<T> Debug for LockstepError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockstepError::IoError(err) => write!(f, "{:?}", err),
            LockstepError::InvalidArgument(msg) => {
                write!(f, "InvalidArgument {{ {} }}", msg)
            }
            LockstepError::TaskPanicked => f.write_str("TaskPanicked"),
            LockstepError::Closed(resource)
            | LockstepError::WouldBlock(resource)
            | LockstepError::TimedOut(resource)
            | LockstepError::Exhausted(resource) => match resource {
                ResourceType::Semaphore {
                    requested,
                    available,
                } => write!(
                    f,
                    "Semaphore {{ requested: {}, available: {} }}",
                    requested, available
                ),
                ResourceType::RwLock => f.write_str("RwLock {{ .. }}"),
                ResourceType::MemoryPool { requested } => {
                    write!(f, "MemoryPool {{ requested: {} }}", requested)
                }
                ResourceType::Queue(_) => f.write_str("Queue {{ .. }}"),
                ResourceType::ThreadPool => f.write_str("ThreadPool {{ .. }}"),
            },
        }
    }
}

impl<T> From<LockstepError<T>> for io::Error {
    fn from(err: LockstepError<T>) -> Self {
        match err {
            LockstepError::IoError(io_err) => io_err,
            LockstepError::InvalidArgument(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            LockstepError::WouldBlock(resource) => io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} would block", resource),
            ),
            LockstepError::TimedOut(resource) => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out", resource),
            ),
            LockstepError::Exhausted(resource) => io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("{} is exhausted", resource),
            ),
            LockstepError::Closed(resource) => {
                io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is closed", resource))
            }
            LockstepError::TaskPanicked => io::Error::new(
                io::ErrorKind::Other,
                "task panicked before producing a result",
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    #[should_panic(expected = "Semaphore (requested 2 but only 0 available) timed out")]
    fn semaphore_timeout_err_msg() {
        let err: Result<(), ()> = Err(LockstepError::TimedOut(ResourceType::Semaphore {
            requested: 2,
            available: 0,
        }));
        panic!("{}", err.unwrap_err().to_string());
    }

    #[test]
    #[should_panic(expected = "RwLock would block")]
    fn rwlock_wouldblock_err_msg() {
        let err: Result<(), ()> = Err(LockstepError::WouldBlock(ResourceType::RwLock));
        panic!("{}", err.unwrap_err().to_string());
    }

    #[test]
    #[should_panic(expected = "Memory pool (requested 4096 bytes) is exhausted")]
    fn pool_exhausted_err_msg() {
        let err: Result<(), ()> = Err(LockstepError::Exhausted(ResourceType::MemoryPool {
            requested: 4096,
        }));
        panic!("{}", err.unwrap_err().to_string());
    }

    #[test]
    #[should_panic(expected = "Queue is closed")]
    fn queue_closed_err_msg() {
        let err: Result<(), i32> = Err(LockstepError::Closed(ResourceType::Queue(Some(42))));
        panic!("{}", err.unwrap_err().to_string());
    }

    #[test]
    fn closed_enqueue_returns_the_item() {
        let err: LockstepError<i32> = LockstepError::Closed(ResourceType::Queue(Some(42)));
        match err {
            LockstepError::Closed(ResourceType::Queue(Some(item))) => assert_eq!(item, 42),
            _ => panic!("item should survive the round trip through the error"),
        }
    }

    #[test]
    fn composite_error_from_into() {
        let err: LockstepError<()> =
            io::Error::new(io::ErrorKind::Other, "test other io-error").into();
        let _: io::Error = err.into();

        let timed: LockstepError<()> = LockstepError::TimedOut(ResourceType::RwLock);
        let converted: io::Error = timed.into();
        assert_eq!(converted.kind(), io::ErrorKind::TimedOut);

        let closed: LockstepError<()> = LockstepError::Closed(ResourceType::Semaphore {
            requested: 1,
            available: 0,
        });
        let converted: io::Error = closed.into();
        assert_eq!(converted.kind(), io::ErrorKind::BrokenPipe);

        let invalid: LockstepError<()> = LockstepError::InvalidArgument("zero delta");
        let converted: io::Error = invalid.into();
        assert_eq!(converted.kind(), io::ErrorKind::InvalidInput);
    }
}
