//! Cleanup handlers and deferred cancellation.
//!
//! A thread's cleanup stack runs only when the thread leaves through
//! [`ThreadTable::exit`](crate::pthread::ThreadTable::exit) or an acted-upon
//! cancellation. Returning normally from the entry closure drops the
//! remaining handlers unexecuted.
//!
//! Early exit is an unwind carrying an [`ExitRequest`] payload, caught by the
//! thread trampoline. Handlers and TLS destructors run under
//! [`run_guarded`]: if one panics the process aborts.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Exit value of a thread that acted on a cancellation request.
pub const CANCELED: usize = usize::MAX;

/// A cleanup handler.
pub type CleanupHandler = Box<dyn FnOnce() + Send + 'static>;

/// Whether a thread acts on cancellation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelState {
    #[default]
    Enabled,
    Disabled,
}

/// Unwind payload that carries a thread's exit value to its trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitRequest {
    pub(crate) value: usize,
    pub(crate) canceled: bool,
}

/// Unwind the calling thread to its trampoline.
pub(crate) fn unwind_with(request: ExitRequest) -> ! {
    panic::resume_unwind(Box::new(request))
}

/// Recover an [`ExitRequest`] from a caught unwind payload.
pub(crate) fn exit_request(payload: &(dyn Any + Send)) -> Option<ExitRequest> {
    payload.downcast_ref::<ExitRequest>().copied()
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run `f`, aborting the process if it panics.
pub(crate) fn run_guarded(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        log::error!(
            target: "rtpthread::cleanup",
            "{what} panicked: {}; aborting",
            panic_message(payload.as_ref())
        );
        std::process::abort();
    }
}

/// LIFO stack of cleanup handlers owned by one thread.
#[derive(Default)]
pub(crate) struct CleanupStack {
    handlers: Vec<CleanupHandler>,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("depth", &self.handlers.len())
            .finish()
    }
}

impl CleanupStack {
    pub(crate) fn push(&mut self, handler: CleanupHandler) {
        self.handlers.push(handler);
    }

    pub(crate) fn pop(&mut self) -> Option<CleanupHandler> {
        self.handlers.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Take every handler, top of stack first.
    pub(crate) fn drain_lifo(&mut self) -> Vec<CleanupHandler> {
        let mut handlers = std::mem::take(&mut self.handlers);
        handlers.reverse();
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn drain_is_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::default();
        for i in 1..=3 {
            let order = Arc::clone(&order);
            stack.push(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(stack.len(), 3);
        for handler in stack.drain_lifo() {
            run_guarded("test handler", handler);
        }
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn pop_returns_top() {
        let hit = Arc::new(Mutex::new(0));
        let mut stack = CleanupStack::default();
        let h = Arc::clone(&hit);
        stack.push(Box::new(move || *h.lock().unwrap() = 1));
        let h = Arc::clone(&hit);
        stack.push(Box::new(move || *h.lock().unwrap() = 2));
        (stack.pop().unwrap())();
        assert_eq!(*hit.lock().unwrap(), 2);
        assert!(stack.pop().is_some());
        assert!(stack.pop().is_none());
    }

    #[test]
    fn exit_request_survives_unwind() {
        let payload = panic::catch_unwind(|| -> usize {
            unwind_with(ExitRequest {
                value: 9,
                canceled: false,
            })
        })
        .unwrap_err();
        assert_eq!(
            exit_request(payload.as_ref()),
            Some(ExitRequest {
                value: 9,
                canceled: false
            })
        );
    }

    #[test]
    fn panic_messages() {
        let payload = panic::catch_unwind(|| -> usize { panic!("boom {}", 1) }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        assert!(exit_request(payload.as_ref()).is_none());
    }
}
