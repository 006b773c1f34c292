//! POSIX thread-local storage (TLS) key management.
//!
//! Keys live in a handle registry. Each key keeps its own map from task to
//! value, so `get`/`set` only contend with other users of the same key.
//! `0` is the null value: storing it removes the slot, and reading an unset
//! slot yields it.
//!
//! Slots are swept when a thread of the runtime terminates. A task the
//! runtime did not create (a host thread) is never swept: its slots live
//! until it stores `0` or the key is deleted.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pthread::cleanup::run_guarded;
use crate::registry::{Registry, handle_newtype};
use crate::sched::{TaskId, current_task};

/// Maximum number of TLS keys.
pub const PTHREAD_KEYS_MAX: usize = 1024;

/// Maximum destructor-call iterations on thread exit (POSIX requires >= 4).
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 4;

/// Destructor run with a thread's last non-null value for a key.
pub type KeyDestructor = fn(usize);

handle_newtype!(
    /// Handle of a thread-local storage key.
    KeyId
);

#[derive(Debug)]
pub(crate) struct KeyObject {
    destructor: Option<KeyDestructor>,
    slots: Mutex<HashMap<TaskId, usize>>,
}

/// Registry of every TLS key in a runtime.
#[derive(Debug)]
pub struct KeyTable {
    registry: Registry<KeyObject>,
}

impl KeyTable {
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        Self {
            registry: Registry::new("key", config.max_handles.min(PTHREAD_KEYS_MAX)),
        }
    }

    /// Create a key, optionally with a destructor.
    pub fn key_create(&self, destructor: Option<KeyDestructor>) -> Result<KeyId> {
        let handle = self.registry.allocate(KeyObject {
            destructor,
            slots: Mutex::new(HashMap::new()),
        })?;
        Ok(KeyId::from_handle(handle))
    }

    /// Delete `key`. Destructors are not run for values still stored.
    pub fn key_delete(&self, key: KeyId) -> Result<()> {
        self.registry
            .release(key.handle(), true)
            .map_err(|_| Error::NotFound)?;
        Ok(())
    }

    /// Store `value` for the calling task. Storing `0` clears the slot.
    ///
    /// Values stored from a task outside the runtime are not swept when that
    /// task ends; clear them explicitly or delete the key.
    pub fn set_specific(&self, key: KeyId, value: usize) -> Result<()> {
        let object = self.registry.lookup(key.handle()).map_err(|_| Error::NotFound)?;
        let mut slots = object.slots.lock();
        if value == 0 {
            slots.remove(&current_task());
        } else {
            slots.insert(current_task(), value);
        }
        Ok(())
    }

    /// Value stored for the calling task, `0` when unset or when `key` does
    /// not exist.
    #[must_use]
    pub fn get_specific(&self, key: KeyId) -> usize {
        self.registry
            .lookup(key.handle())
            .ok()
            .and_then(|object| object.slots.lock().get(&current_task()).copied())
            .unwrap_or(0)
    }

    /// Tasks currently holding a value for `key`.
    pub fn holders(&self, key: KeyId) -> Result<usize> {
        let object = self.registry.lookup(key.handle()).map_err(|_| Error::NotFound)?;
        Ok(object.slots.lock().len())
    }

    /// Live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Clear every slot `task` holds, running destructors.
    ///
    /// Runs on the terminating task. Destructors that store new values cause
    /// another round, up to [`PTHREAD_DESTRUCTOR_ITERATIONS`]; whatever is
    /// left after that is dropped silently.
    pub(crate) fn teardown_task(&self, task: TaskId) {
        let keys = self.registry.entries();
        for round in 0..PTHREAD_DESTRUCTOR_ITERATIONS {
            let pending: Vec<(KeyDestructor, usize)> = keys
                .iter()
                .filter_map(|(_, key)| {
                    let value = key.slots.lock().remove(&task)?;
                    key.destructor.map(|dtor| (dtor, value))
                })
                .collect();
            if pending.is_empty() {
                return;
            }
            log::trace!(
                target: "rtpthread::tls",
                "{task}: destructor round {round} runs {}",
                pending.len()
            );
            for (dtor, value) in pending {
                run_guarded("TLS destructor", || dtor(value));
            }
        }
        for (_, key) in &keys {
            key.slots.lock().remove(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn keys() -> KeyTable {
        KeyTable::new(&RuntimeConfig::default())
    }

    #[test]
    fn set_get_clear() {
        let t = keys();
        let k = t.key_create(None).unwrap();
        assert_eq!(t.get_specific(k), 0);
        t.set_specific(k, 42).unwrap();
        assert_eq!(t.get_specific(k), 42);
        t.set_specific(k, 0).unwrap();
        assert_eq!(t.get_specific(k), 0);
    }

    #[test]
    fn values_are_per_task() {
        let t = Arc::new(keys());
        let k = t.key_create(None).unwrap();
        t.set_specific(k, 1).unwrap();
        let other = {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                let before = t.get_specific(k);
                t.set_specific(k, 2).unwrap();
                (before, t.get_specific(k))
            })
        };
        assert_eq!(other.join().unwrap(), (0, 2));
        assert_eq!(t.get_specific(k), 1);
    }

    #[test]
    fn unknown_key() {
        let t = keys();
        let k = t.key_create(None).unwrap();
        t.key_delete(k).unwrap();
        assert_eq!(t.get_specific(k), 0);
        assert_eq!(t.set_specific(k, 1), Err(Error::NotFound));
        assert_eq!(t.key_delete(k), Err(Error::NotFound));
        assert_eq!(t.get_specific(KeyId::UNINIT), 0);
    }

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    fn record(value: usize) {
        DESTROYED.fetch_add(value, Ordering::SeqCst);
    }

    #[test]
    fn teardown_runs_destructor_with_last_value() {
        let t = Arc::new(keys());
        let k = t.key_create(Some(record)).unwrap();
        let plain = t.key_create(None).unwrap();
        let worker = {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                t.set_specific(k, 5).unwrap();
                t.set_specific(k, 7).unwrap();
                t.set_specific(plain, 9).unwrap();
                t.teardown_task(current_task());
                (t.get_specific(k), t.get_specific(plain))
            })
        };
        assert_eq!(worker.join().unwrap(), (0, 0));
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn host_task_slots_outlive_the_task() {
        let t = Arc::new(keys());
        let k = t.key_create(Some(record)).unwrap();
        let host = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.set_specific(k, 3).unwrap())
        };
        host.join().unwrap();
        assert_eq!(t.holders(k), Ok(1));
        t.key_delete(k).unwrap();
        assert_eq!(t.holders(k), Err(Error::NotFound));
    }

    #[test]
    fn storing_null_releases_the_slot() {
        let t = keys();
        let k = t.key_create(None).unwrap();
        t.set_specific(k, 1).unwrap();
        assert_eq!(t.holders(k), Ok(1));
        t.set_specific(k, 0).unwrap();
        assert_eq!(t.holders(k), Ok(0));
    }

    #[test]
    fn key_limit_is_capped() {
        let t = KeyTable::new(&RuntimeConfig::default().with_max_handles(usize::MAX));
        assert_eq!(t.registry.limit(), PTHREAD_KEYS_MAX);
    }
}
