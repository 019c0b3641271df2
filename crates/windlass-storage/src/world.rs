//! World: a bundled backend

use std::sync::Arc;

use crate::memory::InMemoryStorage;
use crate::queue::{InMemoryQueue, Queue, QueueConfig};
use crate::store::Storage;
use crate::streamer::{InMemoryStreamer, Streamer};

/// A bundled implementation of Storage + Queue + Streamer.
///
/// The runtime is written against this bundle; backends swap freely as long
/// as each part honors its trait contract.
#[derive(Clone)]
pub struct World {
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<dyn Queue>,
    pub streamer: Arc<dyn Streamer>,
}

impl World {
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn Queue>,
        streamer: Arc<dyn Streamer>,
    ) -> Self {
        Self {
            storage,
            queue,
            streamer,
        }
    }

    /// The fully in-memory backend used for tests and embedding.
    pub fn in_memory() -> Self {
        Self::in_memory_with_queue_config(QueueConfig::default())
    }

    pub fn in_memory_with_queue_config(config: QueueConfig) -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            queue: Arc::new(InMemoryQueue::with_config(config)),
            streamer: Arc::new(InMemoryStreamer::new()),
        }
    }
}
