//! Generational arena for operation descriptors.
//!
//! Chain links are [`OpHandle`] values, never references. A handle carries
//! the generation of the slot it was issued for, so a handle kept after its
//! descriptor was released simply stops resolving.

use std::fmt;

/// Stable handle to an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle {
    index: u32,
    generation: u32,
}

impl OpHandle {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab of `T` addressed by [`OpHandle`]. Freed slots are recycled via a
/// free list with their generation bumped.
pub struct OpArena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live: usize,
    high_water: u64,
}

impl<T> OpArena<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            high_water: 0,
        }
    }

    /// Store `value`, returning its handle.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&mut self, value: T) -> OpHandle {
        self.live += 1;
        self.high_water += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return OpHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        OpHandle::new(index, 0)
    }

    /// Remove and return the entry; `None` for a stale or unknown handle.
    pub fn free(&mut self, h: OpHandle) -> Option<T> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(h.index);
        self.live -= 1;
        Some(value)
    }

    #[must_use]
    pub fn get(&self, h: OpHandle) -> Option<&T> {
        let slot = self.slots.get(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, h: OpHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.value.as_mut()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, h: OpHandle) -> bool {
        self.get(h).is_some()
    }

    /// Live entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total entries ever allocated.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }
}

impl<T> Default for OpArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl<T> fmt::Debug for OpArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpArena")
            .field("live", &self.live)
            .field("free_count", &self.free_list.len())
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}
