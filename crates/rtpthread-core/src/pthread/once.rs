//! One-time initialization (`pthread_once`).

/// Runs a closure at most once, no matter how many threads race to it.
#[derive(Debug)]
pub struct Once {
    inner: parking_lot::Once,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: parking_lot::Once::new(),
        }
    }

    /// Run `f` if no call has run yet. Concurrent callers block until the
    /// winning call returns.
    pub fn call<F: FnOnce()>(&self, f: F) {
        self.inner.call_once(f);
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.state().done()
    }
}
