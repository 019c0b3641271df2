//! # Windlass core types
//!
//! Shared data model for the Windlass durable workflow runtime:
//!
//! - **Identifiers**: ULID-backed ids and the deterministic monotonic
//!   factory the orchestrator replays against
//! - **Events**: the append-only log variants every state change is
//!   recorded as
//! - **Entities**: run/step/hook snapshots projected from events
//! - **Errors**: the structured `{message, stack?, code?}` failure surface
//! - **Retry**: exponential-backoff policies evaluated by the step runtime
//! - **Codec**: the class-instance registry and tagged value records
//! - **Messages**: the queue payloads that carry every unit of progress

pub mod codec;
pub mod error;
pub mod event;
pub mod hook;
pub mod ids;
pub mod message;
pub mod retry;
pub mod run;
pub mod step;
pub mod trace;

pub use codec::{ClassInstance, ClassInstanceRef, ClassRegistry, CodecError, Revived, StreamRef};
pub use error::{codes, ErrorInfo};
pub use event::{Event, EventPayload, NewEvent};
pub use hook::{Hook, HookPolicy};
pub use ids::{
    generate_token, CorrelationId, CorrelationKind, EventId, HookId, RunId, StepId, UlidFactory,
};
pub use message::{queues, HealthEndpoint, QueueMessage};
pub use retry::RetryPolicy;
pub use run::{Run, RunStatus};
pub use step::{Step, StepStatus};
pub use trace::TraceCarrier;
