//! Step entity and projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;
use crate::event::{Event, EventPayload};
use crate::ids::{RunId, StepId};

/// Step status
///
/// A step waiting out its retry backoff is `pending` again, with
/// `retry_after` carrying the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for StepStatus {
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

/// A single logical step invocation inside a run, projected from its events.
///
/// The `step_id` is stable across retries; `attempt` tracks the latest
/// attempt observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: StepId,
    pub run_id: RunId,
    pub step_name: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub input: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Deadline before which the next attempt must not start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Step {
    /// Project the initial snapshot from the first `step_started` event.
    pub fn from_started(event: &Event) -> Option<Self> {
        match &event.payload {
            EventPayload::StepStarted {
                step_name,
                input,
                attempt,
            } => Some(Self {
                step_id: event.correlation_id.as_step_id(),
                run_id: event.run_id.clone(),
                step_name: step_name.clone(),
                attempt: *attempt,
                status: StepStatus::Running,
                input: input.clone(),
                output: None,
                error: None,
                started_at: event.created_at,
                completed_at: None,
                retry_after: None,
            }),
            _ => None,
        }
    }

    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::StepStarted { attempt, .. } => {
                self.attempt = (*attempt).max(self.attempt);
                self.status = StepStatus::Running;
                self.retry_after = None;
            }
            EventPayload::StepRetrying {
                attempt,
                retry_after,
                error,
            } => {
                self.attempt = (*attempt).max(self.attempt);
                self.status = StepStatus::Pending;
                self.retry_after = Some(*retry_after);
                self.error = Some(error.clone());
            }
            EventPayload::StepCompleted { output } => {
                self.status = StepStatus::Completed;
                self.output = Some(output.clone());
                self.error = None;
                self.completed_at = Some(event.created_at);
            }
            EventPayload::StepFailed { error } => {
                self.status = StepStatus::Failed;
                self.error = Some(error.clone());
                self.completed_at = Some(event.created_at);
            }
            EventPayload::RunCancelled { .. } => {
                if !self.status.is_terminal() {
                    self.status = StepStatus::Cancelled;
                    self.completed_at = Some(event.created_at);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CorrelationId, EventId, UlidFactory};
    use serde_json::json;

    fn step_event(run_id: &RunId, correlation: &CorrelationId, payload: EventPayload) -> Event {
        Event {
            event_id: EventId::from("01J00000000000000000000003"),
            run_id: run_id.clone(),
            correlation_id: correlation.clone(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_retry_projection() {
        let run_id = RunId::generate();
        let correlation = CorrelationId::step(UlidFactory::system().next());

        let mut step = Step::from_started(&step_event(
            &run_id,
            &correlation,
            EventPayload::StepStarted {
                step_name: "flaky".into(),
                input: vec![json!(1)],
                attempt: 1,
            },
        ))
        .unwrap();
        assert_eq!(step.status, StepStatus::Running);

        let deadline = Utc::now() + chrono::Duration::seconds(2);
        step.apply(&step_event(
            &run_id,
            &correlation,
            EventPayload::StepRetrying {
                attempt: 1,
                retry_after: deadline,
                error: ErrorInfo::new("transient"),
            },
        ));
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_after, Some(deadline));

        step.apply(&step_event(
            &run_id,
            &correlation,
            EventPayload::StepStarted {
                step_name: "flaky".into(),
                input: vec![json!(1)],
                attempt: 2,
            },
        ));
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.attempt, 2);
        assert_eq!(step.retry_after, None);

        step.apply(&step_event(
            &run_id,
            &correlation,
            EventPayload::StepCompleted { output: json!(42) },
        ));
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.output, Some(json!(42)));
        // Completion clears the transient error left by the retry.
        assert_eq!(step.error, None);
    }

    #[test]
    fn test_run_cancellation_cancels_live_step() {
        let run_id = RunId::generate();
        let correlation = CorrelationId::step(UlidFactory::system().next());

        let mut step = Step::from_started(&step_event(
            &run_id,
            &correlation,
            EventPayload::StepStarted {
                step_name: "slow".into(),
                input: vec![],
                attempt: 1,
            },
        ))
        .unwrap();

        step.apply(&step_event(
            &run_id,
            &correlation,
            EventPayload::RunCancelled { reason: None },
        ));
        assert_eq!(step.status, StepStatus::Cancelled);
    }
}
