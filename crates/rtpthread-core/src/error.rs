//! Error type shared by every subsystem.

use thiserror::Error;

use crate::errno;

/// Failure of a threading-layer operation.
///
/// Every operation reports misuse through this type instead of aborting. The
/// only exceptions are cleanup handlers and TLS destructors that panic, which
/// terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// Unknown, deleted or recycled handle.
    #[error("invalid or stale handle")]
    InvalidHandle,
    /// A non-blocking acquisition found the object held.
    #[error("resource busy")]
    Busy,
    /// A bounded wait expired.
    #[error("timed out")]
    Timeout,
    /// Unlock by a task that does not hold the mutex.
    #[error("calling task does not own the mutex")]
    WrongOwner,
    /// A registry could not grow.
    #[error("out of memory")]
    OutOfMemory,
    /// Another thread is already blocked joining this one.
    #[error("thread already joined")]
    AlreadyJoined,
    /// The thread is detached and cannot be joined.
    #[error("thread is detached")]
    Detached,
    /// Unknown TLS key or signal number.
    #[error("not found")]
    NotFound,
    /// An argument is outside its valid domain.
    #[error("invalid argument")]
    InvalidArgument,
    /// The calling task was not created by this runtime.
    #[error("calling task is not a managed thread")]
    NotAThread,
    /// The operation would block the caller on itself.
    #[error("operation would deadlock")]
    WouldDeadlock,
    /// The thread's entry function panicked.
    #[error("thread terminated by a panic")]
    Panicked,
}

impl Error {
    /// POSIX errno equivalent of this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidHandle | Self::InvalidArgument | Self::Detached | Self::AlreadyJoined => {
                errno::EINVAL
            }
            Self::Busy => errno::EBUSY,
            Self::Timeout => errno::ETIMEDOUT,
            Self::WrongOwner | Self::NotAThread => errno::EPERM,
            Self::OutOfMemory => errno::ENOMEM,
            Self::NotFound | Self::Panicked => errno::ESRCH,
            Self::WouldDeadlock => errno::EDEADLK,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_posix_codes() {
        assert_eq!(Error::Busy.errno(), errno::EBUSY);
        assert_eq!(Error::Timeout.errno(), errno::ETIMEDOUT);
        assert_eq!(Error::WrongOwner.errno(), errno::EPERM);
        assert_eq!(Error::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(Error::Detached.errno(), errno::EINVAL);
        assert_eq!(Error::WouldDeadlock.errno(), errno::EDEADLK);
    }

    #[test]
    fn every_declared_errno_is_reachable() {
        let all = [
            Error::InvalidHandle,
            Error::Busy,
            Error::Timeout,
            Error::WrongOwner,
            Error::OutOfMemory,
            Error::AlreadyJoined,
            Error::Detached,
            Error::NotFound,
            Error::InvalidArgument,
            Error::NotAThread,
            Error::WouldDeadlock,
            Error::Panicked,
        ];
        let produced: Vec<i32> = all.iter().map(|e| e.errno()).collect();
        for code in [
            errno::EPERM,
            errno::ESRCH,
            errno::ENOMEM,
            errno::EBUSY,
            errno::EINVAL,
            errno::EDEADLK,
            errno::ETIMEDOUT,
        ] {
            assert!(produced.contains(&code), "errno {code} is never reported");
        }
    }

    #[test]
    fn display_is_lowercase_prose() {
        assert_eq!(Error::InvalidHandle.to_string(), "invalid or stale handle");
        assert_eq!(Error::Busy.to_string(), "resource busy");
    }
}
