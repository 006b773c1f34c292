//! Binary and counting semaphores.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Why a [`Semaphore::take`] did not acquire a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TakeError {
    /// The timeout elapsed with no unit available.
    #[error("semaphore take timed out")]
    Timeout,
    /// The semaphore was closed before or during the wait.
    #[error("semaphore closed")]
    Closed,
}

#[derive(Debug)]
struct SemState {
    count: u32,
    max: u32,
    closed: bool,
}

/// A counting semaphore; a binary semaphore is one with `max == 1`.
///
/// `give` never blocks, so it is safe to call from interrupt-deferred
/// contexts. Waiter wake-up order is whatever the host condvar provides.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<SemState>,
    available: Condvar,
}

impl Semaphore {
    /// Binary semaphore, initially given when `available` is true.
    #[must_use]
    pub fn binary(available: bool) -> Self {
        Self::counting(1, u32::from(available))
    }

    /// Counting semaphore holding at most `max` units, starting at `initial`.
    #[must_use]
    pub fn counting(max: u32, initial: u32) -> Self {
        let max = max.max(1);
        Self {
            state: Mutex::new(SemState {
                count: initial.min(max),
                max,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Take one unit, waiting at most `timeout` (`None` waits forever).
    pub fn take(&self, timeout: Option<Duration>) -> Result<(), TakeError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(TakeError::Closed);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            match (timeout, deadline) {
                (None, _) | (Some(_), None) => self.available.wait(&mut state),
                (Some(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Err(TakeError::Timeout);
                    }
                    // Re-checked at the top of the loop either way.
                    let _ = self.available.wait_until(&mut state, deadline);
                }
            }
        }
    }

    /// Zero-wait take.
    pub fn try_take(&self) -> Result<(), TakeError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TakeError::Closed);
        }
        if state.count == 0 {
            return Err(TakeError::Timeout);
        }
        state.count -= 1;
        Ok(())
    }

    /// Return one unit. Returns `false` when the semaphore is full or closed.
    pub fn give(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.count >= state.max {
            return false;
        }
        state.count += 1;
        self.available.notify_one();
        true
    }

    /// Close the semaphore; every current and future taker gets
    /// [`TakeError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
    }

    /// Units currently available.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn binary_semaphore_saturates_at_one() {
        let sem = Semaphore::binary(false);
        assert!(sem.give());
        assert!(!sem.give());
        assert_eq!(sem.count(), 1);
        assert_eq!(sem.try_take(), Ok(()));
        assert_eq!(sem.try_take(), Err(TakeError::Timeout));
    }

    #[test]
    fn take_times_out() {
        let sem = Semaphore::binary(false);
        let start = Instant::now();
        assert_eq!(
            sem.take(Some(Duration::from_millis(20))),
            Err(TakeError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn give_wakes_blocked_taker() {
        let sem = Arc::new(Semaphore::binary(false));
        let taker = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.take(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(sem.give());
        assert_eq!(taker.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_wakes_blocked_taker_with_error() {
        let sem = Arc::new(Semaphore::binary(false));
        let taker = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.take(None))
        };
        thread::sleep(Duration::from_millis(20));
        sem.close();
        assert_eq!(taker.join().unwrap(), Err(TakeError::Closed));
        assert!(!sem.give());
    }

    #[test]
    fn counting_semaphore_clamps_initial() {
        let sem = Semaphore::counting(3, 10);
        assert_eq!(sem.count(), 3);
    }
}
