//! # Windlass storage contract
//!
//! The interfaces the runtime consumes and the in-memory reference
//! backend:
//!
//! - [`Storage`] — the append-only event log with materialized run/step/
//!   hook views; every mutation in the system is a conditional append
//! - [`Queue`] — at-least-once message bus with visibility timeouts,
//!   idempotency keys, and a broker-level maximum message age
//! - [`Streamer`] — durable named byte-streams keyed by `(run, name)`
//! - [`World`] — a bundle of the three
//!
//! Production backends (SQL, cloud KV, …) implement the same traits out of
//! tree; [`World::in_memory`] provides the reference semantics.

pub mod memory;
pub mod queue;
pub mod store;
pub mod streamer;
pub mod world;

pub use memory::InMemoryStorage;
pub use queue::{
    Delivery, InMemoryQueue, MessageId, MessageMeta, Queue, QueueConfig, QueueError, SendOptions,
};
pub use store::{
    Appended, Entity, ListByCorrelationParams, ListEventsParams, ListHooksParams, ListRunsParams,
    ListStepsParams, Page, SortOrder, Storage, StorageError,
};
pub use streamer::{ChunkStream, InMemoryStreamer, StreamChunk, StreamError, StreamInfo, Streamer};
pub use world::World;
