//! Invocations queue
//!
//! The in-memory map of pending correlation IDs collected during a single
//! replay pass. It belongs to that pass alone: the tick driver drains it
//! when the replay suspends and discards it afterwards.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use windlass_core::{CorrelationId, HookPolicy, StepId};

/// One pending durable operation produced during replay.
#[derive(Debug, Clone)]
pub enum Invocation {
    Step {
        step_id: StepId,
        step_name: String,
        input: Vec<Value>,
    },
    Wait {
        duration: Duration,
        /// Server-assigned once the `wait_created` event is observed.
        resume_at: Option<DateTime<Utc>>,
    },
    Hook {
        metadata: Option<Value>,
        policy: HookPolicy,
    },
}

/// A queue entry and its acknowledgment state.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub correlation_id: CorrelationId,
    pub invocation: Invocation,

    /// Set once the creation event for this correlation was observed in the
    /// log; unacknowledged entries are the ones the flush must emit.
    pub acknowledged: bool,

    /// A retry cycle was observed for this step; the retry scheduler owns
    /// its queue messages from here on.
    pub retry_observed: bool,
}

/// Insertion-ordered set of not-yet-resolved invocations.
#[derive(Debug, Default)]
pub struct InvocationsQueue {
    entries: Vec<PendingInvocation>,
}

impl InvocationsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a provisional (first-reach) entry.
    pub fn insert(&mut self, correlation_id: CorrelationId, invocation: Invocation) {
        self.entries.push(PendingInvocation {
            correlation_id,
            invocation,
            acknowledged: false,
            retry_observed: false,
        });
    }

    /// Insert an entry whose creation event was already observed.
    pub fn insert_acknowledged(&mut self, correlation_id: CorrelationId, invocation: Invocation) {
        self.entries.push(PendingInvocation {
            correlation_id,
            invocation,
            acknowledged: true,
            retry_observed: false,
        });
    }

    /// Record that the step behind `correlation_id` entered a retry cycle.
    pub fn mark_retry_observed(&mut self, correlation_id: &CorrelationId) {
        if let Some(entry) = self.get_mut(correlation_id) {
            entry.retry_observed = true;
        }
    }

    /// Record the server-assigned resume deadline on a wait entry.
    pub fn set_resume_at(&mut self, correlation_id: &CorrelationId, deadline: DateTime<Utc>) {
        if let Some(entry) = self.get_mut(correlation_id) {
            if let Invocation::Wait { resume_at, .. } = &mut entry.invocation {
                *resume_at = Some(deadline);
            }
        }
    }

    /// Remove a resolved entry.
    pub fn resolve(&mut self, correlation_id: &CorrelationId) {
        self.entries
            .retain(|entry| entry.correlation_id != *correlation_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingInvocation> {
        self.entries.iter()
    }

    fn get_mut(&mut self, correlation_id: &CorrelationId) -> Option<&mut PendingInvocation> {
        self.entries
            .iter_mut()
            .find(|entry| entry.correlation_id == *correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut queue = InvocationsQueue::new();
        for name in ["a", "b", "c"] {
            queue.insert(
                CorrelationId::from(format!("step_{name}")),
                Invocation::Step {
                    step_id: StepId::from(format!("step_{name}")),
                    step_name: name.to_string(),
                    input: vec![],
                },
            );
        }

        let order: Vec<&str> = queue
            .entries()
            .map(|entry| entry.correlation_id.as_str())
            .collect();
        assert_eq!(order, vec!["step_a", "step_b", "step_c"]);
    }

    #[test]
    fn test_resolve_removes_entry() {
        let mut queue = InvocationsQueue::new();
        let correlation = CorrelationId::from("wait_x");
        queue.insert(
            correlation.clone(),
            Invocation::Wait {
                duration: Duration::from_secs(1),
                resume_at: None,
            },
        );
        assert_eq!(queue.len(), 1);

        queue.resolve(&correlation);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_set_resume_at() {
        let mut queue = InvocationsQueue::new();
        let correlation = CorrelationId::from("wait_x");
        queue.insert_acknowledged(
            correlation.clone(),
            Invocation::Wait {
                duration: Duration::from_secs(1),
                resume_at: None,
            },
        );

        let deadline = Utc::now();
        queue.set_resume_at(&correlation, deadline);

        let entry = queue.entries().next().unwrap();
        match &entry.invocation {
            Invocation::Wait { resume_at, .. } => assert_eq!(*resume_at, Some(deadline)),
            other => panic!("expected wait, got {other:?}"),
        }
    }
}
