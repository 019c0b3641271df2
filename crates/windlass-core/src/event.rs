//! The event log data model
//!
//! Events form the append-only log for a run. They are the single source of
//! truth: runs, steps, and hooks are projections over them, and replay
//! re-executes the workflow body against them. Events are immutable once
//! written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;
use crate::hook::HookPolicy;
use crate::ids::{CorrelationId, EventId, RunId};
use crate::trace::TraceCarrier;

/// An immutable entry in a run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic ULID; ordering events by ID yields append order.
    pub event_id: EventId,

    pub run_id: RunId,

    /// Ties this event to the primitive that produced or consumes it.
    /// Run-lifecycle events correlate on the bare run ID.
    pub correlation_id: CorrelationId,

    #[serde(flatten)]
    pub payload: EventPayload,

    pub created_at: DateTime<Utc>,
}

/// An event as submitted to `Storage::events_create`, before the server
/// assigns its ID and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub correlation_id: CorrelationId,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl NewEvent {
    pub fn new(correlation_id: CorrelationId, payload: EventPayload) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }
}

/// The tagged event-type variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // =========================================================================
    // Run lifecycle
    // =========================================================================
    RunCreated {
        workflow_name: String,

        /// Ordered argument sequence, opaque to the engine.
        input: Vec<Value>,

        #[serde(default)]
        trace_carrier: TraceCarrier,

        /// Deadline after which no further ticks are processed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },

    RunCompleted {
        output: Value,
    },

    RunFailed {
        error: ErrorInfo,
    },

    RunCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // =========================================================================
    // Step lifecycle
    // =========================================================================
    StepStarted {
        step_name: String,
        input: Vec<Value>,
        /// 1-based; shared `correlation_id` ties retries together.
        attempt: u32,
    },

    StepRetrying {
        attempt: u32,
        retry_after: DateTime<Utc>,
        error: ErrorInfo,
    },

    StepCompleted {
        output: Value,
    },

    StepFailed {
        error: ErrorInfo,
    },

    // =========================================================================
    // Timed waits
    // =========================================================================
    WaitCreated {
        /// Server-assigned at flush time.
        resume_at: DateTime<Utc>,
    },

    WaitCompleted,

    // =========================================================================
    // Hooks
    // =========================================================================
    HookCreated {
        /// Opaque high-entropy token external callers deliver payloads to.
        token: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,

        #[serde(default)]
        policy: HookPolicy,
    },

    HookReceived {
        payload: Value,
    },

    HookDisposed,
}

impl EventPayload {
    /// The wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::WaitCreated { .. } => "wait_created",
            Self::WaitCompleted => "wait_completed",
            Self::HookCreated { .. } => "hook_created",
            Self::HookReceived { .. } => "hook_received",
            Self::HookDisposed => "hook_disposed",
        }
    }

    /// Terminal for its correlation: at most one such event may exist per
    /// `(run, correlation)`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. }
                | Self::RunFailed { .. }
                | Self::RunCancelled { .. }
                | Self::StepCompleted { .. }
                | Self::StepFailed { .. }
                | Self::WaitCompleted
                | Self::HookDisposed
        )
    }

    /// Terminal for the whole run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }

    /// First event of a primitive's correlation (`*_created`/`step_started`).
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            Self::StepStarted { attempt: 1, .. }
                | Self::WaitCreated { .. }
                | Self::HookCreated { .. }
        )
    }
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    pub fn is_run_terminal(&self) -> bool {
        self.payload.is_run_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_payload_serialization() {
        let payload = EventPayload::RunCreated {
            workflow_name: "charge_card".to_string(),
            input: vec![json!({"order": 7})],
            trace_carrier: TraceCarrier::new(),
            expires_at: None,
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"type\":\"run_created\""));

        let parsed: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, parsed);
    }

    #[test]
    fn test_unit_variants_serialize_without_data() {
        let json = serde_json::to_string(&EventPayload::WaitCompleted).unwrap();
        assert_eq!(json, r#"{"type":"wait_completed"}"#);

        let parsed: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, EventPayload::WaitCompleted);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventPayload::RunCompleted { output: json!(1) }.is_terminal());
        assert!(EventPayload::StepFailed {
            error: ErrorInfo::new("x")
        }
        .is_terminal());
        assert!(EventPayload::WaitCompleted.is_terminal());
        assert!(EventPayload::HookDisposed.is_terminal());

        assert!(!EventPayload::StepStarted {
            step_name: "s".into(),
            input: vec![],
            attempt: 1
        }
        .is_terminal());
        assert!(!EventPayload::HookReceived { payload: json!(1) }.is_terminal());
    }

    #[test]
    fn test_run_terminal_is_narrower_than_terminal() {
        assert!(EventPayload::RunCancelled { reason: None }.is_run_terminal());
        assert!(!EventPayload::StepCompleted { output: json!(1) }.is_run_terminal());
    }

    #[test]
    fn test_creation_classification() {
        assert!(EventPayload::WaitCreated {
            resume_at: Utc::now()
        }
        .is_creation());
        assert!(EventPayload::StepStarted {
            step_name: "s".into(),
            input: vec![],
            attempt: 1
        }
        .is_creation());
        // A retry's step_started is not a creation event.
        assert!(!EventPayload::StepStarted {
            step_name: "s".into(),
            input: vec![],
            attempt: 2
        }
        .is_creation());
    }

    #[test]
    fn test_step_retrying_round_trip() {
        let payload = EventPayload::StepRetrying {
            attempt: 2,
            retry_after: Utc::now(),
            error: ErrorInfo::new("flaky").with_code("TIMEOUT"),
        };

        let json = serde_json::to_string(&payload).unwrap();
        let parsed: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, parsed);
    }
}
