//! Idempotency bookkeeping for at-least-once delivery.

use std::collections::{HashSet, VecDeque};

use super::EventId;

const DEFAULT_CAPACITY: usize = 10_000;

/// Remembers recently handled event ids.
///
/// Bounded: once `capacity` ids are held, the oldest is forgotten. A
/// redelivery older than the window would be handled again, so the window
/// must exceed the transport's redelivery horizon.
#[derive(Debug, Clone)]
pub struct ProcessedEvents {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl ProcessedEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a delivery. Returns `false` if the id was already handled.
    pub fn first_delivery(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ProcessedEvents {
    fn default() -> Self {
        Self::new()
    }
}
