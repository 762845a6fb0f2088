//! src/engine/events.rs
//!
//! A small queue of named timers driving the engine's wakeups. The gossip
//! event is created at startup and renewed forever; consensus deadline
//! events are one-shot and removed when their round completes.

use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

/// What to do when an event fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Emit a gossip announcement burst.
    Gossip,
    /// A consensus round's reply deadline, keyed by round message ID.
    ConsensusDue(Uuid),
}

#[derive(Debug)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: HashMap<Uuid, Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EventKind, deadline: Instant) -> Uuid {
        let id = Uuid::new_v4();
        self.events.insert(id, Event { id, kind, deadline });
        id
    }

    /// The nearest deadline, if any events are pending. Ties are broken
    /// arbitrarily.
    pub fn earliest(&self) -> Option<Instant> {
        self.events.values().map(|event| event.deadline).min()
    }

    /// Moves an event's deadline in place.
    pub fn renew(&mut self, id: Uuid, deadline: Instant) -> bool {
        match self.events.get_mut(&id) {
            Some(event) => {
                event.deadline = deadline;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        self.events.remove(&id).is_some()
    }

    /// Events whose deadline has passed. The caller decides whether each is
    /// renewed or removed.
    pub fn due(&self, now: Instant) -> Vec<(Uuid, EventKind)> {
        self.events
            .values()
            .filter(|event| event.deadline <= now)
            .map(|event| (event.id, event.kind))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}
