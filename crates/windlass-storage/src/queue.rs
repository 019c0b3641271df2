//! Durable message bus
//!
//! At-least-once delivery with per-message visibility timeouts, idempotency
//! keys, and a broker-level maximum message age. Handlers must be
//! idempotent at the event-append level; redelivery after a visibility
//! timeout is expected behavior, not an error.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use windlass_core::QueueMessage;

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Message not found (already acked or expired)
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// Backend error
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    fn generate() -> Self {
        Self(format!("msg_{}", Ulid::new()))
    }

    /// The id handed back when a duplicate idempotency key is absorbed.
    fn synthetic(key: &str) -> Self {
        Self(format!("dup_{key}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options for [`Queue::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Broker-level dedup key; duplicate sends are silently absorbed.
    pub idempotency_key: Option<String>,

    /// Keep the message invisible for this long after send.
    pub delay: Option<Duration>,
}

impl SendOptions {
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Delivery metadata handed to handlers alongside the payload.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: MessageId,

    /// 1-based; anything above 1 is a redelivery.
    pub delivery_count: u32,

    /// Broker-side age origin; handlers compare against
    /// [`Queue::max_message_age`] to decide when to re-enqueue.
    pub created_at: DateTime<Utc>,
}

/// One claimed message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub meta: MessageMeta,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a popped message stays invisible before redelivery.
    pub visibility_timeout: Duration,

    /// Broker-level maximum message age; older messages are dead.
    pub max_message_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_message_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_message_age(mut self, age: Duration) -> Self {
        self.max_message_age = age;
        self
    }
}

/// The queue contract the runtime consumes.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Publish a message to its queue.
    ///
    /// A duplicate idempotency key is not an error: the send is absorbed
    /// and a synthetic message id returned.
    async fn send(
        &self,
        message: QueueMessage,
        options: SendOptions,
    ) -> Result<MessageId, QueueError>;

    /// Claim the next visible message on `queue`, making it invisible for
    /// the configured visibility timeout.
    async fn pop(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge (remove) an in-flight message.
    async fn ack(&self, message_id: &MessageId) -> Result<(), QueueError>;

    /// Extend an in-flight message's visibility timeout.
    async fn extend(&self, message_id: &MessageId, timeout: Duration) -> Result<(), QueueError>;

    /// The earliest instant any pending message becomes visible, across all
    /// queues. `None` when the broker is empty.
    fn next_visible_at(&self) -> Option<DateTime<Utc>>;

    /// Broker-level maximum message age.
    fn max_message_age(&self) -> Duration;
}

struct QueuedMessage {
    id: MessageId,
    queue: &'static str,
    message: QueueMessage,
    created_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    messages: HashMap<MessageId, QueuedMessage>,
    seen_keys: HashSet<String>,
}

/// In-memory [`Queue`] implementation.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            config,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().messages.len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn send(
        &self,
        message: QueueMessage,
        options: SendOptions,
    ) -> Result<MessageId, QueueError> {
        let mut state = self.state.lock();

        if let Some(key) = &options.idempotency_key {
            if !state.seen_keys.insert(key.clone()) {
                debug!(key = %key, "duplicate idempotency key absorbed");
                return Ok(MessageId::synthetic(key));
            }
        }

        let now = Utc::now();
        let delay = options
            .delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);

        let id = MessageId::generate();
        state.messages.insert(
            id.clone(),
            QueuedMessage {
                id: id.clone(),
                queue: message.queue(),
                message,
                created_at: now,
                visible_at: now + delay,
                delivery_count: 0,
            },
        );

        Ok(id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let max_age =
            chrono::Duration::from_std(self.config.max_message_age).unwrap_or(chrono::Duration::MAX);

        // Broker-level TTL: messages past the maximum age are dead.
        let dead: Vec<MessageId> = state
            .messages
            .values()
            .filter(|m| now - m.created_at > max_age)
            .map(|m| m.id.clone())
            .collect();
        for id in dead {
            warn!(message_id = %id, "dropping message past broker max age");
            state.messages.remove(&id);
        }

        let candidate = state
            .messages
            .values()
            .filter(|m| m.queue == queue && m.visible_at <= now)
            .min_by_key(|m| (m.visible_at, m.id.as_str().to_string()))
            .map(|m| m.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };

        let visibility =
            chrono::Duration::from_std(self.config.visibility_timeout).unwrap_or(chrono::Duration::MAX);
        let entry = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| QueueError::MessageNotFound(id.clone()))?;
        entry.visible_at = now + visibility;
        entry.delivery_count += 1;

        Ok(Some(Delivery {
            message: entry.message.clone(),
            meta: MessageMeta {
                message_id: entry.id.clone(),
                delivery_count: entry.delivery_count,
                created_at: entry.created_at,
            },
        }))
    }

    async fn ack(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state
            .messages
            .remove(message_id)
            .map(|_| ())
            .ok_or_else(|| QueueError::MessageNotFound(message_id.clone()))
    }

    async fn extend(&self, message_id: &MessageId, timeout: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let entry = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| QueueError::MessageNotFound(message_id.clone()))?;
        entry.visible_at =
            Utc::now() + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Ok(())
    }

    fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        state.messages.values().map(|m| m.visible_at).min()
    }

    fn max_message_age(&self) -> Duration {
        self.config.max_message_age
    }
}
