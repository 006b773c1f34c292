//! Generation-tagged handle registry.
//!
//! A [`Registry`] maps opaque [`Handle`]s to shared objects. Slots live in a
//! growable vector; released slots go on a free list and are recycled with a
//! bumped generation, so a handle kept past its object's release never
//! resolves to the slot's next occupant.
//!
//! One `RwLock` serializes every table operation. Lookups take the read side
//! and hand out an `Arc`, so object methods always run outside the registry
//! lock.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Opaque object handle.
///
/// The low 32 bits hold `slot index + 1`; the high 32 bits hold the slot's
/// generation. The raw value `0` is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// The never-issued sentinel.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | (u64::from(index) + 1))
    }

    /// Slot index, or `None` for the sentinel.
    fn index(self) -> Option<usize> {
        let low = (self.0 & 0xFFFF_FFFF) as u32;
        low.checked_sub(1).map(|i| i as usize)
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "{index}@{}", self.generation()),
            None => f.write_str("null"),
        }
    }
}

// ---------------------------------------------------------------------------
// Slot table
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    payload: Option<Arc<T>>,
    next_free: Option<u32>,
}

#[derive(Debug)]
struct Table<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Table<T> {
    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        let slot = self.slots.get(handle.index()?)?;
        (slot.generation == handle.generation() && slot.payload.is_some()).then_some(slot)
    }
}

/// Lock-protected slot map handing out generation-tagged handles.
#[derive(Debug)]
pub struct Registry<T> {
    name: &'static str,
    limit: usize,
    table: RwLock<Table<T>>,
}

impl<T> Registry<T> {
    /// Empty registry holding at most `limit` live objects. `name` appears in
    /// log records.
    #[must_use]
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit: limit.min(u32::MAX as usize - 1),
            table: RwLock::new(Table {
                slots: Vec::new(),
                free_head: None,
                live: 0,
            }),
        }
    }

    /// Store `payload` and return its handle.
    ///
    /// Fails with [`Error::OutOfMemory`] when the live-object limit is reached
    /// or the slot vector cannot grow.
    pub fn allocate(&self, payload: T) -> Result<Handle> {
        let mut guard = self.table.write();
        let table = &mut *guard;
        if table.live >= self.limit {
            log::warn!(
                target: "rtpthread::registry",
                "{} registry full ({} live)",
                self.name,
                table.live
            );
            return Err(Error::OutOfMemory);
        }

        let payload = Arc::new(payload);
        let handle = match table.free_head {
            Some(index) => {
                let slot = &mut table.slots[index as usize];
                table.free_head = slot.next_free.take();
                slot.payload = Some(payload);
                Handle::new(index, slot.generation)
            }
            None => {
                table
                    .slots
                    .try_reserve(1)
                    .map_err(|_| Error::OutOfMemory)?;
                let index = u32::try_from(table.slots.len()).map_err(|_| Error::OutOfMemory)?;
                table.slots.push(Slot {
                    generation: 0,
                    payload: Some(payload),
                    next_free: None,
                });
                Handle::new(index, 0)
            }
        };
        table.live += 1;
        log::trace!(target: "rtpthread::registry", "{} allocate {handle}", self.name);
        Ok(handle)
    }

    /// Shared reference to the object behind `handle`.
    pub fn lookup(&self, handle: Handle) -> Result<Arc<T>> {
        let table = self.table.read();
        table
            .slot(handle)
            .and_then(|slot| slot.payload.clone())
            .ok_or(Error::InvalidHandle)
    }

    /// Whether `handle` currently resolves.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.table.read().slot(handle).is_some()
    }

    /// Free the slot behind `handle`.
    ///
    /// With `destroy` the registry's reference is dropped and `None` is
    /// returned; otherwise the payload is handed back to the caller. Releasing
    /// an already-released or recycled handle is [`Error::InvalidHandle`].
    pub fn release(&self, handle: Handle, destroy: bool) -> Result<Option<Arc<T>>> {
        let payload = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            if table.slot(handle).is_none() {
                return Err(Error::InvalidHandle);
            }
            let index = handle.index().ok_or(Error::InvalidHandle)?;
            let slot = &mut table.slots[index];
            let payload = slot.payload.take();
            slot.generation = slot.generation.wrapping_add(1);
            slot.next_free = table.free_head;
            table.free_head = u32::try_from(index).ok();
            table.live -= 1;
            payload
        };
        log::trace!(target: "rtpthread::registry", "{} release {handle}", self.name);
        // The payload drops here, after the write lock is gone.
        Ok(if destroy { None } else { payload })
    }

    /// Snapshot of every live entry.
    #[must_use]
    pub fn entries(&self) -> Vec<(Handle, Arc<T>)> {
        let table = self.table.read();
        table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let payload = slot.payload.as_ref()?;
                let index = u32::try_from(index).ok()?;
                Some((Handle::new(index, slot.generation), Arc::clone(payload)))
            })
            .collect()
    }

    /// Live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots allocated so far, live or free.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.read().slots.len()
    }

    /// Maximum live objects.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

// ---------------------------------------------------------------------------
// Typed handles
// ---------------------------------------------------------------------------

/// Declares a typed wrapper around [`Handle`] for one object kind.
macro_rules! handle_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($crate::registry::Handle);

        impl $name {
            /// Never-initialized value. Every operation rejects it with
            /// [`Error::InvalidHandle`](crate::Error::InvalidHandle).
            pub const UNINIT: Self = Self($crate::registry::Handle::NULL);

            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self($crate::registry::Handle::from_raw(raw))
            }

            #[must_use]
            pub const fn into_raw(self) -> u64 {
                self.0.into_raw()
            }

            #[must_use]
            pub const fn handle(self) -> $crate::registry::Handle {
                self.0
            }

            pub(crate) const fn from_handle(handle: $crate::registry::Handle) -> Self {
                Self(handle)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

pub(crate) use handle_newtype;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_lookup() {
        let reg = Registry::new("test", 8);
        let a = reg.allocate("a").unwrap();
        let b = reg.allocate("b").unwrap();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(*reg.lookup(a).unwrap(), "a");
        assert_eq!(*reg.lookup(b).unwrap(), "b");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn null_handle_never_resolves() {
        let reg = Registry::new("test", 8);
        reg.allocate(1_u32).unwrap();
        assert_eq!(reg.lookup(Handle::NULL).unwrap_err(), Error::InvalidHandle);
        assert_eq!(reg.release(Handle::NULL, true).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn recycled_slot_rejects_stale_handle() {
        let reg = Registry::new("test", 8);
        let old = reg.allocate(1_u32).unwrap();
        reg.release(old, true).unwrap();
        let new = reg.allocate(2_u32).unwrap();
        // same slot, new generation
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(reg.lookup(old).unwrap_err(), Error::InvalidHandle);
        assert_eq!(*reg.lookup(new).unwrap(), 2);
        assert_eq!(reg.capacity(), 1);
    }

    #[test]
    fn double_release_is_detected() {
        let reg = Registry::new("test", 8);
        let h = reg.allocate(()).unwrap();
        assert!(reg.release(h, true).unwrap().is_none());
        assert_eq!(reg.release(h, true).unwrap_err(), Error::InvalidHandle);
        assert!(reg.is_empty());
    }

    #[test]
    fn release_without_destroy_returns_payload() {
        let reg = Registry::new("test", 8);
        let h = reg.allocate(String::from("kept")).unwrap();
        let payload = reg.release(h, false).unwrap().unwrap();
        assert_eq!(payload.as_str(), "kept");
    }

    #[test]
    fn limit_is_enforced() {
        let reg = Registry::new("test", 2);
        let a = reg.allocate(1).unwrap();
        reg.allocate(2).unwrap();
        assert_eq!(reg.allocate(3).unwrap_err(), Error::OutOfMemory);
        reg.release(a, true).unwrap();
        assert!(reg.allocate(4).is_ok());
    }

    #[test]
    fn entries_snapshot_lists_live_objects() {
        let reg = Registry::new("test", 8);
        let a = reg.allocate(10).unwrap();
        let b = reg.allocate(20).unwrap();
        let c = reg.allocate(30).unwrap();
        reg.release(b, true).unwrap();
        let mut seen: Vec<(Handle, i32)> = reg.entries().into_iter().map(|(h, v)| (h, *v)).collect();
        seen.sort();
        assert_eq!(seen, vec![(a, 10), (c, 30)]);
    }

    #[test]
    fn live_indices_are_unique_under_concurrency() {
        use std::collections::HashSet;
        use std::thread;

        let reg = Arc::new(Registry::new("test", 1024));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || (0..100).map(|i| reg.allocate(i).unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for w in workers {
            for h in w.join().unwrap() {
                assert!(all.insert(h.index()));
            }
        }
        assert_eq!(reg.len(), 400);
    }

    handle_newtype!(
        /// Test handle.
        ProbeId
    );

    #[test]
    fn typed_handle_round_trips_raw_value() {
        assert_eq!(ProbeId::UNINIT.into_raw(), 0);
        let id = ProbeId::from_raw(0x0000_0002_0000_0005);
        assert_eq!(id.handle().index(), Some(4));
        assert_eq!(id.handle().generation(), 2);
        assert_eq!(id.to_string(), "ProbeId(4@2)");
    }
}
