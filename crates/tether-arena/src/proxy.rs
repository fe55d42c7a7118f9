//! Generation-counted proxy slots.
//!
//! The producer refers to simulation objects only through
//! [`ProxyHandle`]s minted here. A slot's generation is bumped on despawn,
//! so any handle minted before the despawn (including ones still carried
//! by in-flight pull snapshots) resolves to `None` from then on. The slot
//! index is then reused by a later spawn under the new generation.

use tether_core::{ProxyHandle, RigidState};

use crate::error::ProxyError;

#[derive(Clone, Debug)]
struct Slot {
    generation: u32,
    /// `None` while the slot is free.
    last_known: Option<RigidState>,
}

/// Producer-side registry of live proxies and their last known state.
#[derive(Clone, Debug, Default)]
pub struct ProxyArena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
}

impl ProxyArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new object with its initial state.
    pub fn spawn(&mut self, initial: RigidState) -> ProxyHandle {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.last_known = Some(initial);
            return ProxyHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            last_known: Some(initial),
        });
        ProxyHandle::new(index, 0)
    }

    /// Remove an object, invalidating every handle to it.
    ///
    /// Returns the last known state.
    pub fn despawn(&mut self, handle: ProxyHandle) -> Result<RigidState, ProxyError> {
        let slot = self.slot_mut(handle)?;
        let state = slot.last_known.take().ok_or(ProxyError::StaleHandle {
            handle,
            current_generation: slot.generation,
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index());
        self.live -= 1;
        Ok(state)
    }

    /// Last known state of a live object, `None` for stale handles.
    pub fn get(&self, handle: ProxyHandle) -> Option<&RigidState> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.last_known.as_ref()
    }

    /// Mutable access to a live object's last known state.
    pub fn get_mut(&mut self, handle: ProxyHandle) -> Option<&mut RigidState> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.last_known.as_mut()
    }

    /// Check a handle for a producer-side mutation.
    pub fn validate(&self, handle: ProxyHandle) -> Result<(), ProxyError> {
        let slot = self
            .slots
            .get(handle.index() as usize)
            .ok_or(ProxyError::UnknownIndex { handle })?;
        if slot.generation != handle.generation() || slot.last_known.is_none() {
            return Err(ProxyError::StaleHandle {
                handle,
                current_generation: slot.generation,
            });
        }
        Ok(())
    }

    /// Whether `handle` still refers to a live object.
    pub fn contains(&self, handle: ProxyHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Record a newer state for `handle`. Returns `false` if stale.
    pub fn update(&mut self, handle: ProxyHandle, state: RigidState) -> bool {
        match self.get_mut(handle) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no objects are live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live objects.
    pub fn iter(&self) -> impl Iterator<Item = (ProxyHandle, &RigidState)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.last_known
                .as_ref()
                .map(|state| (ProxyHandle::new(i as u32, slot.generation), state))
        })
    }

    /// Remove every object. Slot generations are bumped so that handles
    /// from before the clear stay invalid.
    pub fn clear(&mut self) {
        self.free_list.clear();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.last_known.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free_list.push(i as u32);
        }
        self.free_list.reverse();
        self.live = 0;
    }

    fn slot_mut(&mut self, handle: ProxyHandle) -> Result<&mut Slot, ProxyError> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .ok_or(ProxyError::UnknownIndex { handle })?;
        if slot.generation != handle.generation() {
            return Err(ProxyError::StaleHandle {
                handle,
                current_generation: slot.generation,
            });
        }
        Ok(slot)
    }
}
