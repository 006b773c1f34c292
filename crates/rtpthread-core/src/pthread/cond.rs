//! POSIX condition variables.
//!
//! Every waiter parks on its own binary semaphore, registered in the
//! condition's waiter list before the user mutex is released. A signal that
//! lands between the release and the park is therefore stored in the
//! semaphore rather than lost.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pthread::mutex::{MutexId, MutexTable};
use crate::registry::{Registry, handle_newtype};
use crate::runtime::Runtime;
use crate::sched::{Semaphore, TakeError, TaskId, current_task};

handle_newtype!(
    /// Handle of a condition variable.
    CondId
);

#[derive(Debug)]
struct Waiter {
    task: TaskId,
    wake: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct CondState {
    waiters: Vec<Waiter>,
    bound_mutex: Option<MutexId>,
    destroyed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct CondObject {
    state: Mutex<CondState>,
}

impl CondObject {
    /// Drop `wake` from the waiter list. Returns `false` if a signal already
    /// removed it.
    fn forget(&self, wake: &Arc<Semaphore>) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.waiters.iter().position(|w| Arc::ptr_eq(&w.wake, wake)) else {
            return false;
        };
        state.waiters.remove(pos);
        if state.waiters.is_empty() {
            state.bound_mutex = None;
        }
        true
    }
}

/// Registry of every condition variable in a runtime.
#[derive(Debug)]
pub struct CondTable {
    registry: Registry<CondObject>,
    mutexes: Arc<MutexTable>,
    config: Arc<RuntimeConfig>,
}

impl CondTable {
    pub(crate) fn new(config: Arc<RuntimeConfig>, mutexes: Arc<MutexTable>) -> Self {
        Self {
            registry: Registry::new("cond", config.max_handles),
            mutexes,
            config,
        }
    }

    pub fn init(&self) -> Result<CondId> {
        Ok(CondId::from_handle(self.registry.allocate(CondObject::default())?))
    }

    /// Release `mutex`, wait for a signal, then re-acquire `mutex`.
    ///
    /// Bounded by the runtime's diagnostic lock timeout.
    pub fn wait(&self, cond: CondId, mutex: MutexId) -> Result<()> {
        self.wait_inner(cond, mutex, None)
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`. A deadline that
    /// has already passed returns [`Error::Timeout`] without releasing the
    /// mutex.
    pub fn timed_wait(&self, cond: CondId, mutex: MutexId, deadline: Instant) -> Result<()> {
        self.wait_inner(cond, mutex, Some(deadline))
    }

    fn wait_inner(&self, cond: CondId, mutex: MutexId, deadline: Option<Instant>) -> Result<()> {
        let object = self.registry.lookup(cond.handle())?;
        if !self.mutexes.held_by_caller(mutex)? {
            return Err(Error::WrongOwner);
        }
        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return Err(Error::Timeout);
                }
                Some(deadline - now)
            }
            None => self.config.lock_timeout,
        };

        let me = current_task();
        let wake = Arc::new(Semaphore::binary(false));
        {
            let mut state = object.state.lock();
            if state.destroyed {
                return Err(Error::InvalidHandle);
            }
            match state.bound_mutex {
                Some(bound) if bound != mutex => {
                    log::warn!(
                        target: "rtpthread::cond",
                        "{me} waits on {cond} with {mutex}, but it is bound to {bound}"
                    );
                    return Err(Error::InvalidArgument);
                }
                _ => state.bound_mutex = Some(mutex),
            }
            state.waiters.push(Waiter {
                task: me,
                wake: Arc::clone(&wake),
            });
        }

        let depth = match self.mutexes.release_for_wait(mutex) {
            Ok(depth) => depth,
            Err(err) => {
                object.forget(&wake);
                return Err(err);
            }
        };

        let outcome = match wake.take(timeout) {
            Ok(()) => Ok(()),
            // Not listed any more: a signal raced the timeout and won.
            Err(TakeError::Timeout) if !object.forget(&wake) => Ok(()),
            Err(TakeError::Timeout) => {
                if deadline.is_none() {
                    log::warn!(
                        target: "rtpthread::cond",
                        "{me} gave up waiting on {cond} after {timeout:?}"
                    );
                }
                Err(Error::Timeout)
            }
            Err(TakeError::Closed) => Err(Error::InvalidHandle),
        };

        self.mutexes.reacquire(mutex, depth)?;
        outcome
    }

    /// Wake one waiter, if any.
    pub fn signal(&self, cond: CondId) -> Result<()> {
        let object = self.registry.lookup(cond.handle())?;
        let mut state = object.state.lock();
        if state.waiters.is_empty() {
            return Ok(());
        }
        let waiter = state.waiters.remove(0);
        if state.waiters.is_empty() {
            state.bound_mutex = None;
        }
        log::trace!(target: "rtpthread::cond", "{cond} signals {}", waiter.task);
        waiter.wake.give();
        Ok(())
    }

    /// Wake every current waiter. Returns how many were woken.
    pub fn broadcast(&self, cond: CondId) -> Result<usize> {
        let object = self.registry.lookup(cond.handle())?;
        let mut state = object.state.lock();
        state.bound_mutex = None;
        let woken = state.waiters.len();
        for waiter in state.waiters.drain(..) {
            waiter.wake.give();
        }
        log::trace!(target: "rtpthread::cond", "{cond} broadcast to {woken}");
        Ok(woken)
    }

    /// Destroy `cond`. Fails with [`Error::Busy`] while anyone waits on it.
    pub fn destroy(&self, cond: CondId) -> Result<()> {
        let object = self.registry.lookup(cond.handle())?;
        {
            let mut state = object.state.lock();
            if !state.waiters.is_empty() {
                return Err(Error::Busy);
            }
            state.destroyed = true;
        }
        self.registry.release(cond.handle(), true)?;
        Ok(())
    }

    /// Tasks currently waiting on `cond`.
    pub fn waiters(&self, cond: CondId) -> Result<usize> {
        Ok(self.registry.lookup(cond.handle())?.state.lock().waiters.len())
    }

    /// Live condition variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

/// A condition variable created on first use.
#[derive(Debug, Default)]
pub struct LazyCond {
    id: OnceLock<CondId>,
}

impl LazyCond {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: OnceLock::new(),
        }
    }

    /// Handle of the condition variable, creating it in `rt` on first call.
    pub fn get(&self, rt: &Runtime) -> Result<CondId> {
        if let Some(id) = self.id.get() {
            return Ok(*id);
        }
        let fresh = rt.conds().init()?;
        if self.id.set(fresh).is_err() {
            let _ = rt.conds().destroy(fresh);
        }
        self.id.get().copied().ok_or(Error::InvalidHandle)
    }
}
