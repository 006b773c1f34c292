//! POSIX mutex operations.
//!
//! Each mutex owns one binary native semaphore. The semaphore is the lock;
//! the small state block beside it records who holds it and, for recursive
//! mutexes, how deep. Recursive re-entry by the owner only touches the state
//! block.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::registry::{Registry, handle_newtype};
use crate::runtime::Runtime;
use crate::sched::{Semaphore, TakeError, TaskId, current_task};

// ---------------------------------------------------------------------------
// Mutex type constants
// ---------------------------------------------------------------------------

/// Normal (default) mutex: no error checking, no recursive locking.
pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owning thread can re-lock without deadlock.
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
/// Default mutex type.
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;

/// Mutex flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MutexKind {
    /// Re-locking by the owner blocks.
    #[default]
    Normal,
    /// Re-locking by the owner nests.
    Recursive,
}

impl MutexKind {
    /// Kind for a `PTHREAD_MUTEX_*` constant.
    pub const fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            PTHREAD_MUTEX_NORMAL => Ok(Self::Normal),
            PTHREAD_MUTEX_RECURSIVE => Ok(Self::Recursive),
            _ => Err(Error::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
        }
    }
}

handle_newtype!(
    /// Handle of a mutex.
    MutexId
);

/// Point-in-time view of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexInfo {
    pub kind: MutexKind,
    pub owner: Option<TaskId>,
    /// Nesting depth for recursive mutexes; always 0 for normal ones.
    pub recursion_count: u32,
    pub locked: bool,
}

// ---------------------------------------------------------------------------
// Mutex object
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MutexState {
    owner: Option<TaskId>,
    recursion_count: u32,
    destroyed: bool,
}

#[derive(Debug)]
pub(crate) struct MutexObject {
    kind: MutexKind,
    native: Semaphore,
    state: Mutex<MutexState>,
}

impl MutexObject {
    fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            native: Semaphore::binary(true),
            state: Mutex::new(MutexState::default()),
        }
    }

    /// Re-enter if `me` already holds a recursive mutex. Returns `Ok(true)`
    /// when nothing further is needed.
    fn reenter(&self, me: TaskId) -> Result<bool> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::InvalidHandle);
        }
        if self.kind == MutexKind::Recursive && state.owner == Some(me) {
            state.recursion_count = state.recursion_count.checked_add(1).ok_or(Error::Busy)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Record `me` as the owner once the native semaphore is taken.
    fn claim(&self, me: TaskId) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::InvalidHandle);
        }
        state.owner = Some(me);
        state.recursion_count = u32::from(self.kind == MutexKind::Recursive);
        Ok(())
    }

    /// Clear ownership and give the native semaphore back. Returns the
    /// nesting depth that was dropped.
    fn surrender(&self, state: &mut MutexState) -> u32 {
        let depth = state.recursion_count;
        state.owner = None;
        state.recursion_count = 0;
        self.native.give();
        depth
    }

    fn info(&self) -> MutexInfo {
        let state = self.state.lock();
        MutexInfo {
            kind: self.kind,
            owner: state.owner,
            recursion_count: state.recursion_count,
            locked: state.owner.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mutex table
// ---------------------------------------------------------------------------

/// Registry of every mutex in a runtime.
#[derive(Debug)]
pub struct MutexTable {
    registry: Registry<MutexObject>,
    config: Arc<RuntimeConfig>,
}

impl MutexTable {
    pub(crate) fn new(config: Arc<RuntimeConfig>) -> Self {
        Self {
            registry: Registry::new("mutex", config.max_handles),
            config,
        }
    }

    /// Create an unlocked mutex.
    pub fn init(&self, kind: MutexKind) -> Result<MutexId> {
        let handle = self.registry.allocate(MutexObject::new(kind))?;
        Ok(MutexId::from_handle(handle))
    }

    /// Acquire `id`, blocking up to the runtime's diagnostic lock timeout.
    pub fn lock(&self, id: MutexId) -> Result<()> {
        self.lock_timeout(id, self.config.lock_timeout)
    }

    /// Acquire `id`, blocking up to `timeout` (`None` waits forever).
    pub fn lock_timeout(&self, id: MutexId, timeout: Option<Duration>) -> Result<()> {
        let object = self.registry.lookup(id.handle())?;
        let me = current_task();
        if object.reenter(me)? {
            log::trace!(target: "rtpthread::mutex", "{id} re-entered by {me}");
            return Ok(());
        }
        match object.native.take(timeout) {
            Ok(()) => {}
            Err(TakeError::Closed) => return Err(Error::InvalidHandle),
            Err(TakeError::Timeout) => {
                let owner = object.state.lock().owner;
                log::warn!(
                    target: "rtpthread::mutex",
                    "{me} gave up on {id} after {timeout:?}; held by {owner:?}"
                );
                return Err(Error::Timeout);
            }
        }
        object.claim(me)?;
        log::trace!(target: "rtpthread::mutex", "{id} locked by {me}");
        Ok(())
    }

    /// Acquire `id` without waiting.
    pub fn try_lock(&self, id: MutexId) -> Result<()> {
        let object = self.registry.lookup(id.handle())?;
        let me = current_task();
        if object.reenter(me)? {
            return Ok(());
        }
        match object.native.try_take() {
            Ok(()) => object.claim(me),
            Err(TakeError::Timeout) => Err(Error::Busy),
            Err(TakeError::Closed) => Err(Error::InvalidHandle),
        }
    }

    /// Release one level of `id`.
    pub fn unlock(&self, id: MutexId) -> Result<()> {
        let object = self.registry.lookup(id.handle())?;
        let me = current_task();
        let mut state = object.state.lock();
        if state.owner != Some(me) {
            log::warn!(
                target: "rtpthread::mutex",
                "{me} unlocking {id} held by {:?}",
                state.owner
            );
            return Err(Error::WrongOwner);
        }
        if object.kind == MutexKind::Recursive && state.recursion_count > 1 {
            state.recursion_count -= 1;
            return Ok(());
        }
        object.surrender(&mut state);
        log::trace!(target: "rtpthread::mutex", "{id} unlocked by {me}");
        Ok(())
    }

    /// Destroy `id`. Succeeds even while the mutex is held; blocked lockers
    /// wake with [`Error::InvalidHandle`].
    pub fn destroy(&self, id: MutexId) -> Result<()> {
        let object = self
            .registry
            .release(id.handle(), false)?
            .ok_or(Error::InvalidHandle)?;
        {
            let mut state = object.state.lock();
            if state.owner.is_some() {
                log::debug!(
                    target: "rtpthread::mutex",
                    "destroying {id} while held by {:?}",
                    state.owner
                );
            }
            state.destroyed = true;
        }
        object.native.close();
        Ok(())
    }

    /// Snapshot of `id`'s state.
    pub fn info(&self, id: MutexId) -> Result<MutexInfo> {
        Ok(self.registry.lookup(id.handle())?.info())
    }

    /// Force-release every held mutex. Returns how many were released.
    pub fn flush_all(&self) -> usize {
        let mut released = 0;
        for (handle, object) in self.registry.entries() {
            let mut state = object.state.lock();
            if state.owner.is_some() && !state.destroyed {
                object.surrender(&mut state);
                released += 1;
                log::debug!(
                    target: "rtpthread::mutex",
                    "flushed {}",
                    MutexId::from_handle(handle)
                );
            }
        }
        released
    }

    /// Live mutexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Fully release `id` for a condition wait. Returns the depth to restore.
    pub(crate) fn release_for_wait(&self, id: MutexId) -> Result<u32> {
        let object = self.registry.lookup(id.handle())?;
        let mut state = object.state.lock();
        if state.owner != Some(current_task()) {
            return Err(Error::WrongOwner);
        }
        Ok(object.surrender(&mut state))
    }

    /// Whether the calling task holds `id`.
    pub(crate) fn held_by_caller(&self, id: MutexId) -> Result<bool> {
        let object = self.registry.lookup(id.handle())?;
        let owner = object.state.lock().owner;
        Ok(owner == Some(current_task()))
    }

    /// Re-acquire `id` after a condition wait and restore `depth`.
    pub(crate) fn reacquire(&self, id: MutexId, depth: u32) -> Result<()> {
        self.lock(id)?;
        let object = self.registry.lookup(id.handle())?;
        let mut state = object.state.lock();
        if object.kind == MutexKind::Recursive {
            state.recursion_count = depth.max(1);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lazily initialized mutex
// ---------------------------------------------------------------------------

/// A mutex created on first use.
///
/// Usable in a `static`: the handle is allocated from whichever runtime first
/// calls [`get`](Self::get).
#[derive(Debug)]
pub struct LazyMutex {
    kind: MutexKind,
    id: OnceLock<MutexId>,
}

impl LazyMutex {
    #[must_use]
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            id: OnceLock::new(),
        }
    }

    /// Handle of the mutex, creating it in `rt` on first call.
    pub fn get(&self, rt: &Runtime) -> Result<MutexId> {
        if let Some(id) = self.id.get() {
            return Ok(*id);
        }
        let fresh = rt.mutexes().init(self.kind)?;
        if self.id.set(fresh).is_err() {
            // Another caller won; drop ours.
            let _ = rt.mutexes().destroy(fresh);
        }
        self.id.get().copied().ok_or(Error::InvalidHandle)
    }

    /// Handle if already created.
    #[must_use]
    pub fn id(&self) -> Option<MutexId> {
        self.id.get().copied()
    }
}
