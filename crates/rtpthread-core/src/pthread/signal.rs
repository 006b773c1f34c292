//! Software signal emulation.
//!
//! Each thread keeps a vector of actions and a pending bitmask. Raising a
//! signal only sets a bit; the handler runs later on the target thread when
//! it reaches a checkpoint (`deliver_pending` or an interruptible `sleep`).
//! Raising is therefore safe from any context.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Number of signal slots. Valid signal numbers are `1..NSIG`.
pub const NSIG: usize = 32;

/// Signal number.
pub type Signal = u32;

pub const SIGHUP: Signal = 1;
pub const SIGINT: Signal = 2;
pub const SIGQUIT: Signal = 3;
pub const SIGABRT: Signal = 6;
pub const SIGUSR1: Signal = 10;
pub const SIGUSR2: Signal = 12;
pub const SIGTERM: Signal = 15;

/// What a thread does with a delivered signal.
#[derive(Debug, Clone, Copy, Default)]
pub enum SignalAction {
    /// No handler installed; raising the signal discards it.
    #[default]
    Default,
    /// Explicitly ignored; raising the signal discards it.
    Ignore,
    /// Run this function on the target thread at its next checkpoint.
    Handler(fn(Signal)),
}

impl SignalAction {
    #[must_use]
    pub const fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }
}

/// Whether `sig` cuts an interruptible sleep short.
#[must_use]
pub const fn interrupts_sleep(sig: Signal) -> bool {
    matches!(sig, SIGINT | SIGABRT)
}

const SLEEP_INTERRUPT_MASK: u32 = (1 << SIGINT) | (1 << SIGABRT);

fn slot(sig: Signal) -> Result<usize> {
    let index = sig as usize;
    if index == 0 || index >= NSIG {
        return Err(Error::NotFound);
    }
    Ok(index)
}

/// Per-thread signal vector and pending mask.
#[derive(Debug)]
pub(crate) struct SignalState {
    actions: Mutex<[SignalAction; NSIG]>,
    pending: AtomicU32,
}

impl SignalState {
    pub(crate) fn new() -> Self {
        Self::with_actions([SignalAction::Default; NSIG])
    }

    fn with_actions(actions: [SignalAction; NSIG]) -> Self {
        Self {
            actions: Mutex::new(actions),
            pending: AtomicU32::new(0),
        }
    }

    /// Copy of this vector for a newly created thread. Nothing is pending in
    /// the copy.
    pub(crate) fn inherit(&self) -> Self {
        Self::with_actions(*self.actions.lock())
    }

    /// Install `action` for `sig` and return the previous one.
    pub(crate) fn install(&self, sig: Signal, action: SignalAction) -> Result<SignalAction> {
        let index = slot(sig)?;
        let mut actions = self.actions.lock();
        Ok(std::mem::replace(&mut actions[index], action))
    }

    pub(crate) fn action(&self, sig: Signal) -> Result<SignalAction> {
        Ok(self.actions.lock()[slot(sig)?])
    }

    pub(crate) fn has_handler(&self, sig: Signal) -> Result<bool> {
        Ok(self.action(sig)?.is_handler())
    }

    /// Mark `sig` pending if a handler is installed. Returns whether it was
    /// queued.
    pub(crate) fn mark_pending(&self, sig: Signal) -> Result<bool> {
        if !self.has_handler(sig)? {
            return Ok(false);
        }
        self.pending.fetch_or(1 << sig, Ordering::SeqCst);
        Ok(true)
    }

    pub(crate) fn pending_mask(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether a signal that cuts sleeps short is pending.
    pub(crate) fn interrupt_pending(&self) -> bool {
        self.pending_mask() & SLEEP_INTERRUPT_MASK != 0
    }

    /// Clear the pending mask and run the handler for every bit that was
    /// set, lowest signal first. Handlers run with no lock held. Returns how
    /// many ran.
    pub(crate) fn deliver(&self) -> usize {
        let mask = self.pending.swap(0, Ordering::SeqCst);
        if mask == 0 {
            return 0;
        }
        let actions = *self.actions.lock();
        let mut delivered = 0;
        for (sig, action) in actions.iter().enumerate().skip(1) {
            if mask & (1 << sig) == 0 {
                continue;
            }
            // The handler may have been removed since the signal was raised.
            if let SignalAction::Handler(handler) = action {
                handler(sig as Signal);
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn note(sig: Signal) {
        SEEN.fetch_add(sig as usize, Ordering::SeqCst);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let state = SignalState::new();
        assert_eq!(state.install(0, SignalAction::Ignore).unwrap_err(), Error::NotFound);
        assert_eq!(
            state.install(NSIG as Signal, SignalAction::Ignore).unwrap_err(),
            Error::NotFound
        );
        assert_eq!(state.mark_pending(99), Err(Error::NotFound));
    }

    #[test]
    fn install_returns_previous() {
        let state = SignalState::new();
        let prev = state.install(SIGUSR1, SignalAction::Handler(note)).unwrap();
        assert!(matches!(prev, SignalAction::Default));
        let prev = state.install(SIGUSR1, SignalAction::Ignore).unwrap();
        assert!(prev.is_handler());
    }

    #[test]
    fn unhandled_signal_is_discarded() {
        let state = SignalState::new();
        assert_eq!(state.mark_pending(SIGTERM), Ok(false));
        state.install(SIGTERM, SignalAction::Ignore).unwrap();
        assert_eq!(state.mark_pending(SIGTERM), Ok(false));
        assert_eq!(state.pending_mask(), 0);
    }

    #[test]
    fn delivery_runs_handlers_once() {
        let state = SignalState::new();
        state.install(SIGHUP, SignalAction::Handler(note)).unwrap();
        state.install(SIGQUIT, SignalAction::Handler(note)).unwrap();
        assert_eq!(state.mark_pending(SIGHUP), Ok(true));
        assert_eq!(state.mark_pending(SIGHUP), Ok(true));
        assert_eq!(state.mark_pending(SIGQUIT), Ok(true));
        let before = SEEN.load(Ordering::SeqCst);
        assert_eq!(state.deliver(), 2);
        assert_eq!(SEEN.load(Ordering::SeqCst) - before, (SIGHUP + SIGQUIT) as usize);
        assert_eq!(state.deliver(), 0);
    }

    #[test]
    fn inherited_vector_is_a_copy() {
        let parent = SignalState::new();
        parent.install(SIGUSR2, SignalAction::Handler(note)).unwrap();
        parent.mark_pending(SIGUSR2).unwrap();
        let child = parent.inherit();
        assert!(child.has_handler(SIGUSR2).unwrap());
        assert_eq!(child.pending_mask(), 0);
        parent.install(SIGUSR2, SignalAction::Default).unwrap();
        assert!(child.has_handler(SIGUSR2).unwrap());
    }

    #[test]
    fn only_int_and_abort_interrupt_sleep() {
        assert!(interrupts_sleep(SIGINT));
        assert!(interrupts_sleep(SIGABRT));
        assert!(!interrupts_sleep(SIGUSR1));

        let state = SignalState::new();
        state.install(SIGUSR1, SignalAction::Handler(note)).unwrap();
        state.install(SIGINT, SignalAction::Handler(note)).unwrap();
        state.mark_pending(SIGUSR1).unwrap();
        assert!(!state.interrupt_pending());
        state.mark_pending(SIGINT).unwrap();
        assert!(state.interrupt_pending());
    }
}
