//! The runtime: owner of every registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RuntimeConfig;
use crate::pthread::{CondTable, KeyTable, MutexTable, ThreadTable};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Inner {
    id: u64,
    config: Arc<RuntimeConfig>,
    mutexes: Arc<MutexTable>,
    conds: CondTable,
    keys: Arc<KeyTable>,
    threads: Arc<ThreadTable>,
}

/// Handle to one independent instance of the threading layer.
///
/// Cloning is cheap and every clone refers to the same registries. Objects
/// created through one runtime are unknown to every other runtime.
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Runtime with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Runtime configured from `RTPTHREAD_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_config(RuntimeConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let config = Arc::new(config);
        let mutexes = Arc::new(MutexTable::new(Arc::clone(&config)));
        let conds = CondTable::new(Arc::clone(&config), Arc::clone(&mutexes));
        let keys = Arc::new(KeyTable::new(&config));
        let threads = Arc::new_cyclic(|this| {
            ThreadTable::new(Arc::clone(&config), Arc::clone(&keys), id, this.clone())
        });
        log::debug!(target: "rtpthread::runtime", "runtime {id} up: {config:?}");
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                mutexes,
                conds,
                keys,
                threads,
            }),
        }
    }

    /// Process-unique id of this runtime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn mutexes(&self) -> &MutexTable {
        &self.inner.mutexes
    }

    #[must_use]
    pub fn conds(&self) -> &CondTable {
        &self.inner.conds
    }

    #[must_use]
    pub fn keys(&self) -> &KeyTable {
        &self.inner.keys
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadTable {
        &self.inner.threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MutexKind;

    #[test]
    fn runtimes_are_isolated() {
        let a = Runtime::new();
        let b = Runtime::new();
        assert_ne!(a.id(), b.id());
        let m = a.mutexes().init(MutexKind::Normal).unwrap();
        assert!(a.mutexes().info(m).is_ok());
        // Same raw handle, different registry: b has no such slot.
        assert!(b.mutexes().info(m).is_err());
    }

    #[test]
    fn clones_share_registries() {
        let a = Runtime::new();
        let b = a.clone();
        let m = a.mutexes().init(MutexKind::Recursive).unwrap();
        b.mutexes().lock(m).unwrap();
        assert!(a.mutexes().info(m).unwrap().locked);
        b.mutexes().unlock(m).unwrap();
    }
}
