//! Events consumer: the replay cursor
//!
//! During a tick, every primitive the workflow body reaches consumes events
//! from this cursor. Creation events are claimed strictly in append order
//! (the order primitives were first reached); completion events are claimed
//! by correlation, skipping over other primitives' events without consuming
//! them. When the log runs dry while a primitive is still waiting, the tick
//! suspends.

use windlass_core::{CorrelationId, Event};

/// Cursor over the event-log prefix a tick replays against.
pub struct EventsConsumer {
    events: Vec<Event>,
    consumed: Vec<bool>,
}

impl EventsConsumer {
    /// Build a consumer over the log prefix, excluding `run_created`.
    pub fn new(events: Vec<Event>) -> Self {
        let consumed = vec![false; events.len()];
        Self { events, consumed }
    }

    /// Claim the earliest unconsumed event, whatever it is.
    ///
    /// Used for a primitive's creation claim: on a faithful replay the next
    /// unconsumed event is exactly the primitive's own creation event, so
    /// anything else is log corruption.
    pub fn claim_next(&mut self) -> Option<Event> {
        let index = self.consumed.iter().position(|c| !c)?;
        self.consumed[index] = true;
        Some(self.events[index].clone())
    }

    /// Claim the earliest unconsumed event matching `correlation_id`,
    /// leaving non-matching events for their own primitives.
    pub fn claim_next_matching(&mut self, correlation_id: &CorrelationId) -> Option<Event> {
        let index = self
            .events
            .iter()
            .enumerate()
            .position(|(i, event)| !self.consumed[i] && event.correlation_id == *correlation_id)?;
        self.consumed[index] = true;
        Some(self.events[index].clone())
    }

    /// Whether a terminal event for `correlation_id` exists anywhere in the
    /// prefix, consumed or not.
    pub fn has_terminal_for(&self, correlation_id: &CorrelationId) -> bool {
        self.events
            .iter()
            .any(|event| event.correlation_id == *correlation_id && event.is_terminal())
    }

    /// Number of events not yet claimed by any primitive.
    pub fn remaining(&self) -> usize {
        self.consumed.iter().filter(|c| !**c).count()
    }
}
