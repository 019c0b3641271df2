//! Hook entity and projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventPayload};
use crate::ids::{HookId, RunId};

/// How repeated deliveries to one hook are consumed by the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPolicy {
    /// The first delivery resolves the waiting primitive; later deliveries
    /// are recorded but not consumed.
    #[default]
    Single,

    /// Every delivery is consumable, in arrival order, by repeated receives.
    Stream,
}

/// An externally-resolvable rendez-vous point, projected from its events.
///
/// The token is the external identifier callers use to deliver a payload.
/// Hooks are auto-disposed when their run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub hook_id: HookId,
    pub run_id: RunId,
    pub token: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    pub policy: HookPolicy,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposed_at: Option<DateTime<Utc>>,
}

impl Hook {
    /// Project the initial snapshot from a `hook_created` event.
    pub fn from_created(event: &Event) -> Option<Self> {
        match &event.payload {
            EventPayload::HookCreated {
                token,
                metadata,
                policy,
            } => Some(Self {
                hook_id: event.correlation_id.as_hook_id(),
                run_id: event.run_id.clone(),
                token: token.clone(),
                metadata: metadata.clone(),
                policy: *policy,
                created_at: event.created_at,
                disposed_at: None,
            }),
            _ => None,
        }
    }

    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: &Event) {
        if let EventPayload::HookDisposed = &event.payload {
            if self.disposed_at.is_none() {
                self.disposed_at = Some(event.created_at);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CorrelationId, EventId, UlidFactory};

    #[test]
    fn test_hook_projection() {
        let run_id = RunId::generate();
        let correlation = CorrelationId::hook(UlidFactory::system().next());

        let created = Event {
            event_id: EventId::from("01J00000000000000000000004"),
            run_id: run_id.clone(),
            correlation_id: correlation.clone(),
            payload: EventPayload::HookCreated {
                token: "t0ken".into(),
                metadata: None,
                policy: HookPolicy::Single,
            },
            created_at: Utc::now(),
        };

        let mut hook = Hook::from_created(&created).unwrap();
        assert!(!hook.is_disposed());
        assert_eq!(hook.token, "t0ken");

        hook.apply(&Event {
            event_id: EventId::from("01J00000000000000000000005"),
            run_id,
            correlation_id: correlation,
            payload: EventPayload::HookDisposed,
            created_at: Utc::now(),
        });
        assert!(hook.is_disposed());
    }

    #[test]
    fn test_policy_default_is_single() {
        let json = r#"{"type":"hook_created","data":{"token":"t"}}"#;
        let parsed: EventPayload = serde_json::from_str(json).unwrap();
        match parsed {
            EventPayload::HookCreated { policy, .. } => assert_eq!(policy, HookPolicy::Single),
            _ => panic!("expected hook_created"),
        }
    }
}
