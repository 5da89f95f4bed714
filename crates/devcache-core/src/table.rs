//! Generational resource table
//!
//! Device handles are integers a backend may hand out again once freed. The
//! table gives each live resource a [`ResourceId`] whose generation changes
//! every time its slot is reused, so an id minted before a free never equals
//! one minted after it, even when the backend recycles the device handle.

use std::fmt;

/// Logical identity of a buffer or program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    index: u32,
    generation: u32,
}

impl ResourceId {
    /// Sentinel held by destroyed and never-built resources
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: u32::MAX,
    };

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "res{}v{}", self.index, self.generation)
        } else {
            f.write_str("res<invalid>")
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Slot<T> {
    /// Move to the next generation; `false` retires the slot for good
    ///
    /// Generation `u32::MAX` belongs to the sentinel, and wrapping back to 0
    /// would let ids from the first generation resolve again.
    fn advance(&mut self) -> bool {
        match self.generation.checked_add(1) {
            Some(next) if next < u32::MAX => {
                self.generation = next;
                true
            }
            _ => false,
        }
    }
}

/// Slots of `T` addressed by [`ResourceId`]
#[derive(Debug)]
pub(crate) struct ResourceTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> ResourceTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> ResourceId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ResourceId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ResourceId { index, generation: 0 }
    }

    pub(crate) fn get(&self, id: ResourceId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn remove(&mut self, id: ResourceId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        if slot.advance() {
            self.free.push(id.index);
        }
        self.live -= 1;
        Some(value)
    }

    /// Remove every live entry
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                if slot.advance() {
                    self.free.push(index as u32);
                }
                values.push(value);
            }
        }
        self.live = 0;
        values
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut table = ResourceTable::new();
        let a = table.insert("a");
        assert_eq!(table.remove(a), Some("a"));

        let b = table.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(&"b"));
    }

    #[test]
    fn stale_remove_is_ignored() {
        let mut table = ResourceTable::new();
        let a = table.insert(1);
        table.remove(a);
        let b = table.insert(2);
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(b), Some(2));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn invalid_id_never_resolves() {
        let mut table = ResourceTable::new();
        table.insert(1);
        assert_eq!(table.get(ResourceId::INVALID), None);
        assert!(!ResourceId::INVALID.is_valid());
        assert_eq!(ResourceId::INVALID.to_string(), "res<invalid>");
    }

    #[test]
    fn exhausted_slot_is_retired() {
        let mut table = ResourceTable::new();
        let first = table.insert("first");
        table.slots[0].generation = u32::MAX - 1;
        let last = ResourceId {
            index: first.index(),
            generation: u32::MAX - 1,
        };

        assert_eq!(table.remove(last), Some("first"));
        assert!(table.free.is_empty());
        assert_eq!(table.get(last), None);

        let next = table.insert("next");
        assert_ne!(next.index(), first.index());
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(last), None);
        assert_eq!(table.get(next), Some(&"next"));
    }

    #[test]
    fn drain_retires_exhausted_slots() {
        let mut table = ResourceTable::new();
        table.insert(1);
        table.insert(2);
        table.slots[1].generation = u32::MAX - 1;
        table.drain();
        assert_eq!(table.free, vec![0]);
    }

    #[test]
    fn drain_empties_and_invalidates() {
        let mut table = ResourceTable::new();
        let ids: Vec<_> = (0..3).map(|i| table.insert(i)).collect();
        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(table.len(), 0);
        assert!(ids.iter().all(|&id| table.get(id).is_none()));
    }
}
