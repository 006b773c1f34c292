//! # rtpthread-core
//!
//! POSIX-style threading and synchronization for a small preemptive
//! real-time scheduler.
//!
//! The scheduler underneath (see [`sched`]) only knows tasks, binary/counting
//! semaphores and bounded message queues. On top of those this crate builds
//! threads with join/detach, normal and recursive mutexes, condition
//! variables, thread-local storage, per-thread cleanup stacks with deferred
//! cancellation, and cooperatively delivered software signals.
//!
//! Every object is addressed by an opaque handle issued by a [`registry`];
//! callers never see the storage behind it. All registries are owned by a
//! [`Runtime`], which is an ordinary value rather than a process-wide
//! singleton.
//!
//! ```no_run
//! use rtpthread_core::{MutexKind, Runtime, ThreadAttr};
//!
//! let rt = Runtime::new();
//! let m = rt.mutexes().init(MutexKind::Recursive)?;
//! let worker = rt.clone();
//! let t = rt.threads().create(ThreadAttr::new(), move || {
//!     worker.mutexes().lock(m).ok();
//!     worker.mutexes().unlock(m).ok();
//!     7
//! })?;
//! assert_eq!(rt.threads().join(t)?, 7);
//! # Ok::<(), rtpthread_core::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod errno;
pub mod error;
pub mod pthread;
pub mod registry;
pub mod runtime;
pub mod sched;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use pthread::{
    CANCELED, CancelState, CondId, InitHook, InitialState, KeyId, LazyCond, LazyMutex, MutexId,
    MutexInfo, MutexKind, Once, Signal, SignalAction, ThreadAttr, ThreadId, ThreadInfo,
    ThreadState,
};
pub use registry::{Handle, Registry};
pub use runtime::Runtime;
pub use sched::TaskId;
