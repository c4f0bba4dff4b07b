use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use labelsync_core::{Hlc, HlcClock, SessionId, VectorClock};

use crate::EngineError;

/// Shared source of record and session timestamps.
#[derive(Default)]
pub struct Timestamps {
    clock: Mutex<HlcClock>,
}

impl Timestamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Result<Hlc, EngineError> {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(clock.tick()?)
    }
}

/// In-memory cache of each session's clock.
///
/// One slot per session so unrelated sessions never contend. A slot always
/// holds a fully computed clock; updates compute the next value and replace
/// the old one in a single assignment, which also makes a poisoned lock safe
/// to keep using.
#[derive(Default)]
pub struct ClockStore {
    slots: RwLock<HashMap<SessionId, Arc<Mutex<VectorClock>>>>,
}

impl ClockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: SessionId) -> Option<Arc<Mutex<VectorClock>>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(&session_id).cloned()
    }

    fn slot_or_insert(&self, session_id: SessionId) -> Arc<Mutex<VectorClock>> {
        if let Some(slot) = self.slot(session_id) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(session_id).or_default())
    }

    /// Copy of the cached clock, `None` when the session is not cached.
    pub fn get(&self, session_id: SessionId) -> Option<VectorClock> {
        let slot = self.slot(session_id)?;
        let clock = slot.lock().unwrap_or_else(|e| e.into_inner());
        Some(clock.clone())
    }

    /// Merge `clock` into the session's slot and return the result. Merging
    /// is order independent, so seeding from storage and recording new
    /// writes can interleave freely.
    pub fn merge(&self, session_id: SessionId, clock: &VectorClock) -> VectorClock {
        let slot = self.slot_or_insert(session_id);
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        let next = current.merge(clock);
        *current = next.clone();
        next
    }

    pub fn remove(&self, session_id: SessionId) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
