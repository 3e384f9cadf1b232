//! Deferred event pool.
//!
//! An event is deferred when no transition consumes it and an active state
//! lists its name in `defer`. Deferred events are owned by the innermost
//! deferring state; when that state exits they move to the front of the main
//! queue, keeping their original relative order and preceding any event
//! queued later.

use crate::event::Event;
use harel_model::StateId;

#[derive(Debug, Clone)]
struct DeferredEvent {
    owner: StateId,
    event: Event,
}

/// Arrival-ordered deferred events for one instance.
#[derive(Debug, Clone, Default)]
pub struct DeferredPool {
    entries: Vec<DeferredEvent>,
}

impl DeferredPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parks an event under the deferring state.
    pub fn defer(&mut self, owner: StateId, event: Event) {
        self.entries.push(DeferredEvent { owner, event });
    }

    /// Removes and returns, in original arrival order, every event whose
    /// owner is in the exited set.
    pub fn release(&mut self, exited: &[StateId]) -> Vec<Event> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let mut released = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if exited.contains(&entry.owner) {
                released.push(entry.event);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        released
    }

    /// Read-only view for introspection.
    pub fn iter(&self) -> impl Iterator<Item = (StateId, &Event)> {
        self.entries.iter().map(|e| (e.owner, &e.event))
    }
}
