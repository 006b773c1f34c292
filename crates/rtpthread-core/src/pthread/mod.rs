//! POSIX threads.
//!
//! Threads, mutexes, condition variables, thread-local storage, cleanup and
//! cancellation, and software signals, each kept in its own handle registry
//! and reached through a [`Runtime`](crate::Runtime).

pub mod attr;
pub mod cleanup;
pub mod cond;
pub mod mutex;
pub mod once;
pub mod signal;
pub mod thread;
pub mod tls;

pub use attr::{InitHook, InitialState, PTHREAD_STACK_MIN, ThreadAttr};
pub use cleanup::{CANCELED, CancelState};
pub use cond::{CondId, CondTable, LazyCond};
pub use mutex::{
    LazyMutex, MutexId, MutexInfo, MutexKind, MutexTable, PTHREAD_MUTEX_DEFAULT,
    PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE,
};
pub use once::Once;
pub use signal::{NSIG, Signal, SignalAction};
pub use thread::{ExitStatus, ThreadId, ThreadInfo, ThreadState, ThreadTable};
pub use tls::{KeyId, KeyTable, PTHREAD_DESTRUCTOR_ITERATIONS, PTHREAD_KEYS_MAX};
