//! Run entity and projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;
use crate::event::{Event, EventPayload};
use crate::ids::RunId;
use crate::trace::TraceCarrier;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no primitive reached yet.
    Pending,

    Running,

    Completed,

    Failed,

    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single execution of a workflow, projected from its event log.
///
/// Runs are never mutated directly: every state change is an event append,
/// and callers receive immutable snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub input: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub trace_carrier: TraceCarrier,
}

impl Run {
    /// Project the initial snapshot from a `run_created` event.
    ///
    /// Returns `None` if the event is of any other type.
    pub fn from_created(event: &Event) -> Option<Self> {
        match &event.payload {
            EventPayload::RunCreated {
                workflow_name,
                input,
                trace_carrier,
                expires_at,
            } => Some(Self {
                run_id: event.run_id.clone(),
                workflow_name: workflow_name.clone(),
                status: RunStatus::Pending,
                input: input.clone(),
                output: None,
                error: None,
                started_at: event.created_at,
                completed_at: None,
                expires_at: *expires_at,
                trace_carrier: trace_carrier.clone(),
            }),
            _ => None,
        }
    }

    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::RunCompleted { output } => {
                self.status = RunStatus::Completed;
                self.output = Some(output.clone());
                self.completed_at = Some(event.created_at);
            }
            EventPayload::RunFailed { error } => {
                self.status = RunStatus::Failed;
                self.error = Some(error.clone());
                self.completed_at = Some(event.created_at);
            }
            EventPayload::RunCancelled { .. } => {
                if !self.status.is_terminal() {
                    self.status = RunStatus::Cancelled;
                    self.completed_at = Some(event.created_at);
                }
            }
            EventPayload::StepStarted { .. }
            | EventPayload::WaitCreated { .. }
            | EventPayload::HookCreated { .. } => {
                if self.status == RunStatus::Pending {
                    self.status = RunStatus::Running;
                }
            }
            _ => {}
        }
    }

    /// Whether the run's expiry deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CorrelationId, EventId};
    use serde_json::json;

    fn created_event(run_id: &RunId) -> Event {
        Event {
            event_id: EventId::from("01J00000000000000000000001"),
            run_id: run_id.clone(),
            correlation_id: CorrelationId::run(run_id),
            payload: EventPayload::RunCreated {
                workflow_name: "order".to_string(),
                input: vec![json!(1), json!(2)],
                trace_carrier: TraceCarrier::new(),
                expires_at: None,
            },
            created_at: Utc::now(),
        }
    }

    fn with_payload(run_id: &RunId, payload: EventPayload) -> Event {
        Event {
            event_id: EventId::from("01J00000000000000000000002"),
            run_id: run_id.clone(),
            correlation_id: CorrelationId::run(run_id),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_projection_lifecycle() {
        let run_id = RunId::generate();
        let mut run = Run::from_created(&created_event(&run_id)).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.input.len(), 2);

        run.apply(&with_payload(
            &run_id,
            EventPayload::StepStarted {
                step_name: "charge".into(),
                input: vec![],
                attempt: 1,
            },
        ));
        assert_eq!(run.status, RunStatus::Running);

        run.apply(&with_payload(
            &run_id,
            EventPayload::RunCompleted { output: json!(14) },
        ));
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!(14)));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_cancel_does_not_override_terminal() {
        let run_id = RunId::generate();
        let mut run = Run::from_created(&created_event(&run_id)).unwrap();

        run.apply(&with_payload(
            &run_id,
            EventPayload::RunCompleted { output: json!(1) },
        ));
        run.apply(&with_payload(
            &run_id,
            EventPayload::RunCancelled { reason: None },
        ));

        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_from_created_rejects_other_events() {
        let run_id = RunId::generate();
        let event = with_payload(&run_id, EventPayload::WaitCompleted);
        assert!(Run::from_created(&event).is_none());
    }

    #[test]
    fn test_expiry() {
        let run_id = RunId::generate();
        let mut run = Run::from_created(&created_event(&run_id)).unwrap();
        assert!(!run.is_expired(Utc::now()));

        run.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(run.is_expired(Utc::now()));
    }
}
