//! Generation-checked handle table
//!
//! Objects handed to the host (clients, tunnels) live in a [`HandleTable`]
//! and are referred to by a [`Handle`]: a slot index paired with the
//! slot's generation. Releasing a slot bumps its generation, so a stale
//! handle held by the host can never reach a newer object that reuses the
//! slot. Raw addresses never cross the boundary.

use std::sync::Arc;

/// Opaque reference into a [`HandleTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Packs the handle into the `u64` passed across the C boundary.
    ///
    /// Generations start at 1, so a valid handle is never `0`.
    #[must_use]
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpacks a raw handle; `0` is rejected
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Arena of shared values addressed by generation-checked handles
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store a value and return its handle
    pub fn insert(&mut self, value: Arc<T>) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle {
            index,
            generation: 1,
        }
    }

    /// Look up a live value
    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.clone())
    }

    /// Release a value; the handle and every copy of it become stale
    pub fn remove(&mut self, handle: Handle) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;

        // A slot whose generation would wrap is retired instead of reused.
        slot.generation = slot.generation.wrapping_add(1);
        if slot.generation != 0 {
            self.free.push(handle.index);
        }
        self.live -= 1;
        Some(value)
    }

    /// Number of live values
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
