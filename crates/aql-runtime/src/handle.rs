//! Generation-checked handles and the arenas that issue them
//!
//! A handle packs a 32-bit slot index with a 32-bit generation. Generations
//! start at 1, so the raw value 0 is never issued, and removing an object bumps
//! its slot's generation so an old handle no longer resolves after the slot is
//! reused.

use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle to a runtime object
pub struct Handle<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The never-issued zero handle.
    pub const NULL: Self = Self::from_raw(0);

    const fn new(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << 32) | index as u64)
    }

    /// Reinterpret a raw value, e.g. a signal handle read out of a packet.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Raw value as carried in packets.
    pub const fn to_raw(self) -> u64 {
        self.raw
    }

    pub const fn is_null(self) -> bool {
        self.raw == 0
    }

    pub const fn index(self) -> u32 {
        self.raw as u32
    }

    pub const fn generation(self) -> u32 {
        (self.raw >> 32) as u32
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index(), self.generation())
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.raw)
    }
}

// ================================================================================================
// Arena
// ================================================================================================

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Slot arena issuing [`Handle`]s for shared objects
pub(crate) struct Arena<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Insert an object that needs to know its own handle.
    ///
    /// `build` runs under the arena write lock; on error nothing is inserted.
    pub(crate) fn insert_with<E>(&self, build: impl FnOnce(Handle<T>) -> Result<Arc<T>, E>) -> Result<Arc<T>, E> {
        let mut slots = self.slots.write();
        let (index, generation) = match slots.free.last().copied() {
            Some(index) => (index, slots.entries[index as usize].generation),
            None => (slots.entries.len() as u32, 1),
        };

        let value = build(Handle::new(index, generation))?;

        if slots.free.last() == Some(&index) {
            slots.free.pop();
        } else {
            slots.entries.push(Slot {
                generation,
                value: None,
            });
        }
        slots.entries[index as usize].value = Some(Arc::clone(&value));
        slots.live += 1;
        Ok(value)
    }

    pub(crate) fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        if handle.is_null() {
            return None;
        }
        let slots = self.slots.read();
        let slot = slots.entries.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.clone()
    }

    /// Remove an object; its handle (and every copy of it) goes stale.
    pub(crate) fn remove(&self, handle: Handle<T>) -> Option<Arc<T>> {
        if handle.is_null() {
            return None;
        }
        let mut slots = self.slots.write();
        let slot = slots.entries.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        // A slot whose generation wrapped is retired rather than reused
        let reusable = slot.generation != 0;
        slots.live -= 1;
        if reusable {
            slots.free.push(handle.index());
        }
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().live
    }

    /// Live objects in slot order.
    pub(crate) fn values(&self) -> Vec<Arc<T>> {
        self.slots
            .read()
            .entries
            .iter()
            .filter_map(|slot| slot.value.clone())
            .collect()
    }

    /// Object at position `nth` among live objects, for lazy iteration.
    pub(crate) fn nth(&self, nth: usize) -> Option<Arc<T>> {
        self.slots
            .read()
            .entries
            .iter()
            .filter_map(|slot| slot.value.as_ref())
            .nth(nth)
            .cloned()
    }

    /// Remove every object.
    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        let mut slots = self.slots.write();
        let Slots { entries, free, live } = &mut *slots;
        let mut drained = Vec::with_capacity(*live);
        for (index, slot) in entries.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                if slot.generation != 0 {
                    free.push(index as u32);
                }
                drained.push(value);
            }
        }
        *live = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn insert(arena: &Arena<String>, value: &str) -> Handle<String> {
        let mut issued = Handle::NULL;
        arena
            .insert_with(|handle| {
                issued = handle;
                Ok::<_, Infallible>(Arc::new(value.to_string()))
            })
            .unwrap();
        issued
    }

    #[test]
    fn test_handles_are_never_zero() {
        let arena = Arena::new();
        let handle = insert(&arena, "a");
        assert!(!handle.is_null());
        assert_eq!(handle.index(), 0);
        assert_eq!(handle.generation(), 1);
        assert!(arena.get(Handle::NULL).is_none());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let arena = Arena::new();
        let first = insert(&arena, "a");
        assert_eq!(arena.remove(first).as_deref().map(String::as_str), Some("a"));

        let second = insert(&arena, "b");
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert!(arena.get(first).is_none());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.get(second).as_deref().map(String::as_str), Some("b"));
    }

    #[test]
    fn test_failed_build_inserts_nothing() {
        let arena: Arena<String> = Arena::new();
        let result = arena.insert_with(|_| Err("nope"));
        assert_eq!(result.err(), Some("nope"));
        assert_eq!(arena.len(), 0);
        let handle = insert(&arena, "c");
        assert_eq!(handle.index(), 0);
    }

    #[test]
    fn test_nth_and_drain() {
        let arena = Arena::new();
        let a = insert(&arena, "a");
        insert(&arena, "b");
        insert(&arena, "c");
        arena.remove(a);
        assert_eq!(arena.nth(0).as_deref().map(String::as_str), Some("b"));
        assert_eq!(arena.nth(2), None);
        assert_eq!(arena.drain().len(), 2);
        assert_eq!(arena.len(), 0);
        assert!(arena.values().is_empty());
    }

    #[test]
    fn test_raw_round_trip() {
        let handle: Handle<u8> = Handle::new(7, 3);
        assert_eq!(Handle::<u8>::from_raw(handle.to_raw()), handle);
        assert_eq!(handle.to_string(), "0x300000007");
    }
}
