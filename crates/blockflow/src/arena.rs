//! Generational slot arena.
//!
//! Blocks and bindings live in arenas and are addressed by typed handles.
//! Freeing a slot bumps its generation, so a handle kept past destruction is
//! detected instead of aliasing whatever reuses the slot.

use std::fmt;
use std::marker::PhantomData;

/// Generational index into an arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

impl SlotId {
    pub const INVALID: Self = Self { index: u32::MAX, generation: 0 };

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

/// Typed handle over a [`SlotId`].
pub trait ArenaKey: Copy + Eq {
    fn from_slot(slot: SlotId) -> Self;
    fn slot(self) -> SlotId;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(SlotId);

        impl $name {
            pub const INVALID: Self = Self(SlotId::INVALID);

            pub fn index(self) -> u32 {
                self.0.index
            }

            pub fn generation(self) -> u32 {
                self.0.generation
            }
        }

        impl ArenaKey for $name {
            fn from_slot(slot: SlotId) -> Self {
                Self(slot)
            }

            fn slot(self) -> SlotId {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}v{})", stringify!($name), self.0.index, self.0.generation)
            }
        }
    };
}

arena_key!(
    /// Handle to a block. Stale handles (destroyed blocks) fail validation.
    BlockId
);
arena_key!(
    /// Handle to a live binding record.
    BindingId
);

impl PartialOrd for SlotId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlotId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena allocator with slot reuse.
pub struct Arena<K, T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            live: 0,
            _key: PhantomData,
        }
    }

    /// Allocate a slot holding `value`.
    pub fn alloc(&mut self, value: T) -> K {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            // Reuse freed slot, generation was already bumped on free
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            K::from_slot(SlotId { index, generation: slot.generation })
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, value: Some(value) });
            K::from_slot(SlotId { index, generation: 0 })
        }
    }

    /// Allocate a slot whose value needs to know its own key.
    pub fn alloc_with(&mut self, make: impl FnOnce(K) -> T) -> K {
        let key = self.alloc_placeholder();
        let slot = key.slot();
        self.slots[slot.index as usize].value = Some(make(key));
        key
    }

    fn alloc_placeholder(&mut self) -> K {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let generation = self.slots[index as usize].generation;
            K::from_slot(SlotId { index, generation })
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, value: None });
            K::from_slot(SlotId { index, generation: 0 })
        }
    }

    /// Free a slot, returning its value. Stale keys return `None`.
    pub fn free(&mut self, key: K) -> Option<T> {
        if !self.is_valid(key) {
            return None;
        }
        let slot = key.slot();
        let entry = &mut self.slots[slot.index as usize];
        // Bump generation immediately to invalidate outstanding handles
        entry.generation = entry.generation.wrapping_add(1);
        let value = entry.value.take();
        self.free_list.push(slot.index);
        self.live -= 1;
        value
    }

    /// Check if a key is valid (correct generation, occupied).
    pub fn is_valid(&self, key: K) -> bool {
        let slot = key.slot();
        self.slots
            .get(slot.index as usize)
            .is_some_and(|entry| entry.generation == slot.generation && entry.value.is_some())
    }

    pub fn get(&self, key: K) -> Option<&T> {
        let slot = key.slot();
        let entry = self.slots.get(slot.index as usize)?;
        if entry.generation == slot.generation {
            entry.value.as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let slot = key.slot();
        let entry = self.slots.get_mut(slot.index as usize)?;
        if entry.generation == slot.generation {
            entry.value.as_mut()
        } else {
            None
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    K::from_slot(SlotId { index: index as u32, generation: entry.generation }),
                    value,
                )
            })
        })
    }
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
