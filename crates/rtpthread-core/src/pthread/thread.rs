//! POSIX thread creation and management.
//!
//! Implements the thread lifecycle (create, join, detach, self, exit) and
//! the per-thread services that hang off the thread control block: cleanup
//! handlers, deferred cancellation, signal vectors and interruptible sleep.
//!
//! ## Architecture
//!
//! Each thread gets:
//! - A native task started through [`sched::spawn`](crate::sched::spawn)
//! - A `ThreadControl` block in the runtime's thread registry, addressed by
//!   [`ThreadId`]
//! - A one-slot join queue the trampoline posts its [`ExitStatus`] to
//! - A startup semaphore: `create` returns only after the new task has
//!   registered itself and run the attribute's init hook
//!
//! Suspension is cooperative. [`ThreadTable::suspend`] marks the target and it
//! parks at its next checkpoint (`test_cancel`, `deliver_pending` or either
//! end of a `sleep`) until [`ThreadTable::resume`].
//!
//! The trampoline runs the entry closure under `catch_unwind`. Early exit and
//! cancellation are unwinds carrying an exit request; any other panic is
//! reported to the joiner as [`Error::Panicked`].

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pthread::attr::{self, InitialState, ThreadAttr};
use crate::pthread::cleanup::{
    CANCELED, CancelState, CleanupStack, ExitRequest, exit_request, panic_message, run_guarded,
    unwind_with,
};
use crate::pthread::once::Once;
use crate::pthread::signal::{Signal, SignalAction, SignalState, interrupts_sleep};
use crate::pthread::tls::KeyTable;
use crate::registry::{Registry, handle_newtype};
use crate::sched::{self, Queue, Semaphore, Task, TaskConfig, TaskId};

handle_newtype!(
    /// Handle of a thread.
    ThreadId
);

thread_local! {
    /// `(runtime id, thread)` of the layer thread running on this task.
    static CURRENT: Cell<Option<(u64, ThreadId)>> = const { Cell::new(None) };
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created; the trampoline has not started yet.
    Starting,
    /// The trampoline is running the entry closure (or waiting for resume).
    Running,
    /// The entry closure is done; the exit status is waiting for a joiner.
    Finished,
    /// The exit status was consumed.
    Joined,
}

/// How a thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The entry closure returned this value.
    Returned(usize),
    /// The thread called `exit` with this value.
    Exited(usize),
    /// The thread acted on a cancellation request.
    Canceled,
    /// The entry closure panicked.
    Panicked,
}

impl ExitStatus {
    /// Value reported to the joiner.
    pub fn value(self) -> Result<usize> {
        match self {
            Self::Returned(value) | Self::Exited(value) => Ok(value),
            Self::Canceled => Ok(CANCELED),
            Self::Panicked => Err(Error::Panicked),
        }
    }
}

/// Point-in-time view of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub task: TaskId,
    pub name: String,
    pub state: ThreadState,
    pub detached: bool,
    /// Another thread is blocked in `join` on this one.
    pub has_joiner: bool,
    /// Blocked in an interruptible sleep.
    pub sleeping: bool,
    /// Parked at a checkpoint until resumed.
    pub suspended: bool,
    pub priority: u8,
    pub core: Option<usize>,
    pub stack_size: usize,
    pub cleanup_depth: usize,
    pub pending_signals: u32,
    pub cancel_state: CancelState,
}

// ---------------------------------------------------------------------------
// Thread control block
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Lifecycle {
    state: ThreadState,
    detached: bool,
    joiner: bool,
    native: Option<Task>,
}

#[derive(Debug)]
pub(crate) struct ThreadControl {
    id: OnceLock<ThreadId>,
    task: TaskId,
    attr: ThreadAttr,
    stack_size: usize,
    name: Mutex<String>,
    lifecycle: Mutex<Lifecycle>,
    join_channel: Queue<ExitStatus>,
    cleanup: Mutex<CleanupStack>,
    signals: SignalState,
    cancel_enabled: AtomicBool,
    cancel_requested: AtomicBool,
    suspend_requested: AtomicBool,
    suspended: AtomicBool,
    resume: Semaphore,
    started: Semaphore,
    sleep_wake: Semaphore,
    sleeping: AtomicBool,
}

impl ThreadControl {
    fn id(&self) -> ThreadId {
        self.id.get().copied().unwrap_or(ThreadId::UNINIT)
    }

    fn cancel_state(&self) -> CancelState {
        if self.cancel_enabled.load(Ordering::Acquire) {
            CancelState::Enabled
        } else {
            CancelState::Disabled
        }
    }

    /// Unwind if a cancellation request is pending and cancellation is on.
    fn cancel_point(&self) {
        if self.cancel_enabled.load(Ordering::Acquire)
            && self.cancel_requested.swap(false, Ordering::AcqRel)
        {
            log::debug!(target: "rtpthread::thread", "{} acting on cancel", self.id());
            unwind_with(ExitRequest {
                value: CANCELED,
                canceled: true,
            });
        }
    }

    /// Park while a suspension is requested. Returns early when an enabled
    /// cancellation is pending so the following cancel point acts on it.
    fn suspend_point(&self) {
        while self.suspend_requested.load(Ordering::SeqCst) {
            if self.cancel_enabled.load(Ordering::Acquire)
                && self.cancel_requested.load(Ordering::SeqCst)
            {
                break;
            }
            self.suspended.store(true, Ordering::SeqCst);
            let _ = self.resume.take(None);
            self.suspended.store(false, Ordering::SeqCst);
        }
    }

    fn checkpoint(&self) {
        self.suspend_point();
        self.cancel_point();
    }

    fn info(&self) -> ThreadInfo {
        let life = self.lifecycle.lock();
        ThreadInfo {
            id: self.id(),
            task: self.task,
            name: self.name.lock().clone(),
            state: life.state,
            detached: life.detached,
            has_joiner: life.joiner,
            sleeping: self.sleeping.load(Ordering::SeqCst),
            suspended: self.suspended.load(Ordering::SeqCst),
            priority: self.attr.priority,
            core: self.attr.core,
            stack_size: self.stack_size,
            cleanup_depth: self.cleanup.lock().len(),
            pending_signals: self.signals.pending_mask(),
            cancel_state: self.cancel_state(),
        }
    }
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

/// Registry of every thread in a runtime.
#[derive(Debug)]
pub struct ThreadTable {
    registry: Registry<ThreadControl>,
    keys: Arc<KeyTable>,
    config: Arc<RuntimeConfig>,
    runtime_id: u64,
    this: Weak<ThreadTable>,
}

impl ThreadTable {
    pub(crate) fn new(
        config: Arc<RuntimeConfig>,
        keys: Arc<KeyTable>,
        runtime_id: u64,
        this: Weak<ThreadTable>,
    ) -> Self {
        Self {
            registry: Registry::new("thread", config.max_handles),
            keys,
            config,
            runtime_id,
            this,
        }
    }

    /// Control block of the calling thread, if it belongs to this runtime.
    fn current_control(&self) -> Result<Arc<ThreadControl>> {
        let id = self.current().ok_or(Error::NotAThread)?;
        self.registry.lookup(id.handle()).map_err(|_| Error::NotAThread)
    }

    fn control(&self, id: ThreadId) -> Result<Arc<ThreadControl>> {
        self.registry.lookup(id.handle())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start `entry` on a new thread.
    ///
    /// The thread inherits the caller's signal vector when the caller is a
    /// thread of this runtime. Returns once the new task has started and its
    /// init hook, if any, has run.
    pub fn create<F>(&self, attr: ThreadAttr, entry: F) -> Result<ThreadId>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        attr.validate(&self.config)?;
        let signals = match self.current_control() {
            Ok(parent) => parent.signals.inherit(),
            Err(_) => SignalState::new(),
        };
        let task = TaskId::allocate();
        let stack_size = attr.effective_stack_size(&self.config);
        let name = attr
            .name
            .clone()
            .unwrap_or_else(|| format!("thread-{}", task.as_u64()));
        let detached = attr.detached;
        let suspended = attr.initial_state == InitialState::Suspended;

        let handle = self.registry.allocate(ThreadControl {
            id: OnceLock::new(),
            task,
            stack_size,
            name: Mutex::new(name.clone()),
            lifecycle: Mutex::new(Lifecycle {
                state: ThreadState::Starting,
                detached,
                joiner: false,
                native: None,
            }),
            join_channel: Queue::bounded(1),
            cleanup: Mutex::new(CleanupStack::default()),
            signals,
            cancel_enabled: AtomicBool::new(true),
            cancel_requested: AtomicBool::new(false),
            suspend_requested: AtomicBool::new(suspended),
            suspended: AtomicBool::new(false),
            resume: Semaphore::binary(false),
            started: Semaphore::binary(false),
            sleep_wake: Semaphore::binary(false),
            sleeping: AtomicBool::new(false),
            attr,
        })?;
        let id = ThreadId::from_handle(handle);
        let control = self.registry.lookup(handle)?;
        let _ = control.id.set(id);

        let config = TaskConfig {
            name,
            stack_size,
            priority: control.attr.priority,
            core: control.attr.core,
        };
        let trampoline = Trampoline {
            table: self.this.clone(),
            keys: Arc::clone(&self.keys),
            runtime_id: self.runtime_id,
            control: Arc::clone(&control),
        };
        match sched::spawn(task, config, move || trampoline.run(entry)) {
            Ok(native) => {
                control.lifecycle.lock().native = Some(native);
                let _ = control.started.take(None);
                log::debug!(target: "rtpthread::thread", "created {id} on {task}");
                Ok(id)
            }
            Err(err) => {
                log::warn!(target: "rtpthread::thread", "spawning {id} failed: {err}");
                let _ = self.registry.release(handle, true);
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Wait for `thread` to finish and return its exit value.
    ///
    /// Frees the thread; its handle is stale afterwards.
    pub fn join(&self, thread: ThreadId) -> Result<usize> {
        let control = self.control(thread)?;
        if self.current() == Some(thread) {
            return Err(Error::WouldDeadlock);
        }
        {
            let mut life = control.lifecycle.lock();
            if life.detached {
                return Err(Error::Detached);
            }
            if life.joiner {
                return Err(Error::AlreadyJoined);
            }
            life.joiner = true;
        }

        let status = control.join_channel.receive(None).ok_or(Error::InvalidHandle)?;
        let native = {
            let mut life = control.lifecycle.lock();
            life.state = ThreadState::Joined;
            life.native.take()
        };
        if let Some(native) = native {
            let _ = native.join();
        }
        self.registry.release(thread.handle(), true)?;
        log::debug!(target: "rtpthread::thread", "joined {thread}: {status:?}");
        status.value()
    }

    /// Make `thread` free itself when it finishes. A thread that already
    /// finished is freed now.
    pub fn detach(&self, thread: ThreadId) -> Result<()> {
        let control = self.control(thread)?;
        let native = {
            let mut life = control.lifecycle.lock();
            if life.detached {
                return Err(Error::Detached);
            }
            if life.joiner {
                return Err(Error::AlreadyJoined);
            }
            life.detached = true;
            if life.state != ThreadState::Finished {
                log::debug!(target: "rtpthread::thread", "detached {thread}");
                return Ok(());
            }
            life.native.take()
        };
        if let Some(native) = native {
            let _ = native.join();
        }
        self.registry.release(thread.handle(), true)?;
        log::debug!(target: "rtpthread::thread", "detached and reaped {thread}");
        Ok(())
    }

    /// The calling thread, if it was created by this runtime.
    #[must_use]
    pub fn current(&self) -> Option<ThreadId> {
        CURRENT
            .get()
            .filter(|(runtime, _)| *runtime == self.runtime_id)
            .map(|(_, id)| id)
    }

    /// Ask `thread` to park at its next checkpoint. A thread suspending
    /// itself parks before this returns.
    pub fn suspend(&self, thread: ThreadId) -> Result<()> {
        let control = self.control(thread)?;
        control.suspend_requested.store(true, Ordering::SeqCst);
        log::debug!(target: "rtpthread::thread", "suspend requested for {thread}");
        if self.current() == Some(thread) {
            control.checkpoint();
        }
        Ok(())
    }

    /// Release a suspended thread, including one created with
    /// [`InitialState::Suspended`]. Resuming a running thread does nothing.
    pub fn resume(&self, thread: ThreadId) -> Result<()> {
        let control = self.control(thread)?;
        if control.suspend_requested.swap(false, Ordering::SeqCst) {
            control.resume.give();
            log::debug!(target: "rtpthread::thread", "resumed {thread}");
        }
        Ok(())
    }

    pub fn set_name(&self, thread: ThreadId, name: &str) -> Result<()> {
        attr::validate_name(name)?;
        let control = self.control(thread)?;
        *control.name.lock() = name.to_string();
        Ok(())
    }

    pub fn name(&self, thread: ThreadId) -> Result<String> {
        Ok(self.control(thread)?.name.lock().clone())
    }

    pub fn info(&self, thread: ThreadId) -> Result<ThreadInfo> {
        Ok(self.control(thread)?.info())
    }

    /// Every live thread.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId> {
        self.registry
            .entries()
            .into_iter()
            .map(|(handle, _)| ThreadId::from_handle(handle))
            .collect()
    }

    /// Run `f` unless `once` already ran.
    pub fn once<F: FnOnce()>(&self, once: &Once, f: F) {
        once.call(f);
    }

    /// Terminate the calling thread with `value`, running its cleanup
    /// handlers top to bottom first.
    ///
    /// # Panics
    ///
    /// Panics when called from a task that is not a thread of this runtime.
    pub fn exit(&self, value: usize) -> ! {
        if self.current_control().is_err() {
            log::error!(target: "rtpthread::thread", "exit called outside a managed thread");
            panic!("exit called outside a managed thread");
        }
        unwind_with(ExitRequest {
            value,
            canceled: false,
        })
    }

    // -- cleanup and cancellation -------------------------------------------

    /// Push `handler` onto the calling thread's cleanup stack.
    pub fn cleanup_push<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.current_control()?.cleanup.lock().push(Box::new(handler));
        Ok(())
    }

    /// Pop the top cleanup handler, running it when `execute` is set.
    /// Returns whether there was one.
    pub fn cleanup_pop(&self, execute: bool) -> Result<bool> {
        let handler = self.current_control()?.cleanup.lock().pop();
        match handler {
            Some(handler) if execute => {
                run_guarded("cleanup handler", handler);
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Ask `thread` to terminate at its next cancellation point.
    pub fn cancel(&self, thread: ThreadId) -> Result<()> {
        let control = self.control(thread)?;
        control.cancel_requested.store(true, Ordering::SeqCst);
        if control.sleeping.load(Ordering::SeqCst) {
            control.sleep_wake.give();
        }
        if control.suspend_requested.load(Ordering::SeqCst) {
            control.resume.give();
        }
        log::debug!(target: "rtpthread::thread", "cancel requested for {thread}");
        Ok(())
    }

    /// Set the calling thread's cancel state and return the previous one.
    pub fn set_cancel_state(&self, state: CancelState) -> Result<CancelState> {
        let control = self.current_control()?;
        let previous = control.cancel_state();
        control
            .cancel_enabled
            .store(state == CancelState::Enabled, Ordering::Release);
        Ok(previous)
    }

    /// Cancellation point: park if suspended, then terminate if a request
    /// is pending.
    pub fn test_cancel(&self) -> Result<()> {
        self.current_control()?.checkpoint();
        Ok(())
    }

    // -- signals ------------------------------------------------------------

    /// Install `action` for `sig` on the calling thread. Returns the previous
    /// action.
    pub fn signal(&self, sig: Signal, action: SignalAction) -> Result<SignalAction> {
        self.current_control()?.signals.install(sig, action)
    }

    /// Mark `sig` pending on `thread`. Returns `false` when the thread has no
    /// handler for it and the signal was discarded.
    pub fn raise(&self, thread: ThreadId, sig: Signal) -> Result<bool> {
        let control = self.control(thread)?;
        let queued = raise_on(&control, sig)?;
        log::trace!(target: "rtpthread::signal", "raise {sig} on {thread}: queued={queued}");
        Ok(queued)
    }

    /// Mark `sig` pending on every thread that handles it. Returns how many
    /// threads it was queued on.
    pub fn raise_all(&self, sig: Signal) -> Result<usize> {
        let mut queued = 0;
        for (_, control) in self.registry.entries() {
            if raise_on(&control, sig)? {
                queued += 1;
            }
        }
        log::trace!(target: "rtpthread::signal", "raise {sig} on all: queued on {queued}");
        Ok(queued)
    }

    /// Whether `thread` has a handler installed for `sig`.
    pub fn has_handler(&self, thread: ThreadId, sig: Signal) -> Result<bool> {
        self.control(thread)?.signals.has_handler(sig)
    }

    /// Run the handlers of every signal pending on the calling thread.
    /// Also a cancellation point. Returns how many handlers ran.
    pub fn deliver_pending(&self) -> Result<usize> {
        let control = self.current_control()?;
        let delivered = control.signals.deliver();
        control.checkpoint();
        Ok(delivered)
    }

    /// Sleep for `duration`. Returns `true` when `SIGINT` or `SIGABRT` was
    /// raised on the thread during the sleep and cut it short.
    ///
    /// On a thread of this runtime this is a cancellation point and delivers
    /// pending signals on wake-up. Other tasks simply sleep.
    pub fn sleep(&self, duration: Duration) -> Result<bool> {
        let Ok(control) = self.current_control() else {
            sched::sleep(duration);
            return Ok(false);
        };
        control.signals.deliver();
        control.checkpoint();
        while control.sleep_wake.try_take().is_ok() {}
        control.sleeping.store(true, Ordering::SeqCst);
        // A request that raced the store above found `sleeping` still clear.
        let interrupted = control.cancel_requested.load(Ordering::SeqCst)
            || control.signals.interrupt_pending()
            || control.sleep_wake.take(Some(duration)).is_ok();
        control.sleeping.store(false, Ordering::SeqCst);
        control.signals.deliver();
        control.checkpoint();
        Ok(interrupted)
    }

    /// Live threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

fn raise_on(control: &ThreadControl, sig: Signal) -> Result<bool> {
    let queued = control.signals.mark_pending(sig)?;
    if queued && interrupts_sleep(sig) && control.sleeping.load(Ordering::SeqCst) {
        control.sleep_wake.give();
    }
    Ok(queued)
}

// ---------------------------------------------------------------------------
// Trampoline (runs on the new task)
// ---------------------------------------------------------------------------

struct Trampoline {
    table: Weak<ThreadTable>,
    keys: Arc<KeyTable>,
    runtime_id: u64,
    control: Arc<ThreadControl>,
}

impl Trampoline {
    fn run<F>(self, entry: F)
    where
        F: FnOnce() -> usize,
    {
        let control = &self.control;
        let id = control.id();
        CURRENT.set(Some((self.runtime_id, id)));
        control.lifecycle.lock().state = ThreadState::Running;
        if let Some(init) = control.attr.init {
            run_guarded("init hook", || init(id));
        }
        control.started.give();
        control.suspend_point();

        let status = match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(value) => {
                // Normal return leaves handlers unexecuted.
                let discarded = control.cleanup.lock().drain_lifo();
                drop(discarded);
                ExitStatus::Returned(value)
            }
            Err(payload) => match exit_request(payload.as_ref()) {
                Some(request) => {
                    let handlers = control.cleanup.lock().drain_lifo();
                    for handler in handlers {
                        run_guarded("cleanup handler", handler);
                    }
                    if request.canceled {
                        ExitStatus::Canceled
                    } else {
                        ExitStatus::Exited(request.value)
                    }
                }
                None => {
                    log::error!(
                        target: "rtpthread::thread",
                        "{id} panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    ExitStatus::Panicked
                }
            },
        };

        self.keys.teardown_task(control.task);

        let mut life = control.lifecycle.lock();
        life.state = ThreadState::Finished;
        if life.detached {
            let native = life.native.take();
            drop(life);
            if let Some(table) = self.table.upgrade() {
                let _ = table.registry.release(id.handle(), true);
            }
            drop(native);
        } else {
            let _ = control.join_channel.try_send(status);
            drop(life);
        }
        log::debug!(target: "rtpthread::thread", "{id} finished: {status:?}");
        CURRENT.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pthread::tls::KeyTable;

    fn table() -> Arc<ThreadTable> {
        let config = Arc::new(RuntimeConfig::default());
        let keys = Arc::new(KeyTable::new(&config));
        Arc::new_cyclic(|this| ThreadTable::new(config, keys, 0xfeed, this.clone()))
    }

    #[test]
    fn create_and_join_returns_value() {
        let t = table();
        let id = t.create(ThreadAttr::new(), || 41 + 1).unwrap();
        assert_eq!(t.join(id), Ok(42));
        assert_eq!(t.info(id), Err(Error::InvalidHandle));
        assert!(t.is_empty());
    }

    #[test]
    fn non_layer_thread_has_no_current() {
        let t = table();
        assert_eq!(t.current(), None);
        assert_eq!(t.cleanup_pop(false), Err(Error::NotAThread));
        assert_eq!(t.test_cancel(), Err(Error::NotAThread));
    }

    #[test]
    fn current_inside_thread() {
        let t = table();
        let inner = Arc::clone(&t);
        let id = t
            .create(ThreadAttr::new(), move || {
                inner.current().map_or(0, |id| id.into_raw() as usize)
            })
            .unwrap();
        assert_eq!(t.join(id), Ok(id.into_raw() as usize));
    }

    #[test]
    fn panic_surfaces_to_joiner() {
        let t = table();
        let id = t.create(ThreadAttr::new(), || panic!("entry failed")).unwrap();
        assert_eq!(t.join(id), Err(Error::Panicked));
    }

    #[test]
    fn invalid_attr_is_rejected() {
        let t = table();
        let attr = ThreadAttr::new().with_priority(0);
        assert_eq!(t.create(attr, || 0), Err(Error::InvalidArgument));
        assert!(t.is_empty());
    }

    #[test]
    fn raise_without_handler_is_discarded() {
        let t = table();
        let attr = ThreadAttr::new().with_initial_state(InitialState::Suspended);
        let id = t.create(attr, || 0).unwrap();
        assert_eq!(t.raise(id, crate::pthread::signal::SIGUSR1), Ok(false));
        assert_eq!(t.raise(id, 0), Err(Error::NotFound));
        assert_eq!(t.info(id).unwrap().pending_signals, 0);
        t.resume(id).unwrap();
        assert_eq!(t.join(id), Ok(0));
        assert_eq!(t.raise(id, crate::pthread::signal::SIGUSR1), Err(Error::InvalidHandle));
    }

    #[test]
    fn exit_status_values() {
        assert_eq!(ExitStatus::Returned(3).value(), Ok(3));
        assert_eq!(ExitStatus::Exited(4).value(), Ok(4));
        assert_eq!(ExitStatus::Canceled.value(), Ok(CANCELED));
        assert_eq!(ExitStatus::Panicked.value(), Err(Error::Panicked));
    }
}
