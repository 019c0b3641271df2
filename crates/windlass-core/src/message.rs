//! Queue message shapes
//!
//! Every unit of forward progress travels through the queue as one of these
//! messages. Workflow ticks and timer firings go to the workflow queue;
//! step executions to the step queue; health probes to whichever endpoint
//! they target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CorrelationId, RunId, StepId};
use crate::trace::TraceCarrier;

/// Queue names the runtime dispatches on.
pub mod queues {
    pub const WORKFLOW: &str = "windlass_workflow";
    pub const STEP: &str = "windlass_step";
}

/// Which queue handler a health probe exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEndpoint {
    Workflow,
    Step,
}

impl std::fmt::Display for HealthEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Step => write!(f, "step"),
        }
    }
}

/// A message on the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    /// Drive one replay pass of the run's workflow body.
    WorkflowTick {
        run_id: RunId,

        #[serde(default)]
        trace_carrier: TraceCarrier,
    },

    /// Execute one attempt of a step.
    StepExecute {
        run_id: RunId,
        step_id: StepId,
        step_name: String,
        input: Vec<Value>,
        attempt: u32,

        #[serde(default)]
        trace_carrier: TraceCarrier,
    },

    /// Delayed carrier for a timed wait; firing appends `wait_completed`.
    TimerFire {
        run_id: RunId,
        correlation_id: CorrelationId,
        resume_at: DateTime<Utc>,

        #[serde(default)]
        trace_carrier: TraceCarrier,
    },

    /// In-band liveness probe (§ health-check protocol).
    HealthCheck {
        endpoint: HealthEndpoint,
        nonce: String,
    },
}

impl QueueMessage {
    /// The queue this message is routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::WorkflowTick { .. } | Self::TimerFire { .. } => queues::WORKFLOW,
            Self::StepExecute { .. } => queues::STEP,
            Self::HealthCheck { endpoint, .. } => match endpoint {
                HealthEndpoint::Workflow => queues::WORKFLOW,
                HealthEndpoint::Step => queues::STEP,
            },
        }
    }

    /// Broker-level dedup key, where one applies.
    ///
    /// Step executions are keyed per attempt so a crashed flush retried by
    /// redelivery cannot double-enqueue the same attempt.
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            Self::StepExecute {
                step_id, attempt, ..
            } => Some(format!("{step_id}:{attempt}")),
            Self::TimerFire {
                run_id,
                correlation_id,
                resume_at,
                ..
            } => Some(format!(
                "{run_id}:{correlation_id}:{}",
                resume_at.timestamp_millis()
            )),
            Self::WorkflowTick { .. } | Self::HealthCheck { .. } => None,
        }
    }

    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::WorkflowTick { run_id, .. }
            | Self::StepExecute { run_id, .. }
            | Self::TimerFire { run_id, .. } => Some(run_id),
            Self::HealthCheck { .. } => None,
        }
    }
}
