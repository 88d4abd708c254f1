//! Generational arena for task records.
//!
//! Records are stored in a `Vec` of slots; removed slots go on a free list
//! and are reused with a bumped generation counter, so a stale index can
//! never resolve to a recycled slot. No unsafe code; everything relies on
//! bounds checks and generation validation.

use core::fmt;

/// An index into an [`Arena`], carrying a generation counter.
///
/// Two indices compare equal only if they name the same slot *and* the same
/// occupancy of that slot. An index held across a remove/insert cycle of
/// its slot simply stops resolving.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// A generational arena.
///
/// Provides stable indices for inserted values. Removal bumps the slot's
/// generation so outstanding indices to the removed value go stale instead
/// of aliasing the next occupant.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena").field("len", &self.len).finish()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value, reusing a vacant slot when one exists.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    let generation = *generation;
                    self.free_head = *next_free;
                    *slot = Slot::Occupied { value, generation };
                    ArenaIndex {
                        index: free,
                        generation,
                    }
                }
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena exceeds u32 slots");
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            ArenaIndex {
                index,
                generation: 0,
            }
        }
    }

    /// Returns a reference to the value at `idx`, if it is still live.
    #[must_use]
    pub fn get(&self, idx: ArenaIndex) -> Option<&T> {
        match self.slots.get(idx.index as usize) {
            Some(Slot::Occupied { value, generation }) if *generation == idx.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Returns a mutable reference to the value at `idx`, if still live.
    #[must_use]
    pub fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(idx.index as usize) {
            Some(Slot::Occupied { value, generation }) if *generation == idx.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Removes and returns the value at `idx`.
    ///
    /// The slot's generation is bumped, so `idx` (and any copy of it) stops
    /// resolving immediately.
    pub fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == idx.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = core::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(idx.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Drops every occupied slot and resets the arena.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_head = None;
        self.len = 0;
    }
}
