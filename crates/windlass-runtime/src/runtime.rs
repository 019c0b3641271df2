//! The runtime facade
//!
//! Wires registries, configuration, and a [`World`] into a working engine:
//! starting runs, delivering hook payloads, cancelling, waking sleeps, and
//! driving the queue either to idleness (tests, embedding) or as a
//! long-running worker loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use windlass_core::{
    codec::ClassRegistry, queues, CorrelationId, EventPayload, HealthEndpoint, NewEvent,
    QueueMessage, RunId, StreamRef, TraceCarrier,
};
use windlass_storage::{
    ChunkStream, Delivery, QueueError, SendOptions, StorageError, StreamError, World,
};

use crate::health::{HealthChecker, HealthRendezvous, HealthReport};
use crate::processor::{HandlerOutcome, MessageProcessor, ProcessorConfig};
use crate::step::{Step, StepRegistry};
use crate::streams::StreamerConfig;
use crate::workflow::{Workflow, WorkflowRegistry};

/// Runtime errors surfaced to embedding callers.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Stream error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Delivery to a hook that was already disposed
    #[error("hook already disposed: {0}")]
    HookDisposed(String),

    /// Input could not be serialized into the run's argument sequence
    #[error("input not serializable: {0}")]
    InputSerialization(#[from] serde_json::Error),
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub processor: ProcessorConfig,
    pub streamer: StreamerConfig,
}

/// Options for starting a run.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Distributed-trace headers to record on the run and propagate on its
    /// messages.
    pub trace_carrier: TraceCarrier,

    /// Drop all processing after this long.
    pub expires_in: Option<Duration>,
}

impl StartOptions {
    pub fn with_trace_carrier(mut self, carrier: TraceCarrier) -> Self {
        self.trace_carrier = carrier;
        self
    }

    pub fn with_expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }
}

/// A durable workflow runtime over one [`World`].
///
/// # Example
///
/// ```ignore
/// let mut runtime = Runtime::new(World::in_memory());
/// runtime.register_workflow::<OrderTotal>();
/// runtime.register_step::<Add>();
///
/// let run_id = runtime.start::<OrderTotal>((2, 3), StartOptions::default()).await?;
/// runtime.run_until_idle().await;
///
/// let run = runtime.world().storage.run_get(&run_id).await?;
/// ```
pub struct Runtime {
    world: World,
    workflows: Arc<RwLock<WorkflowRegistry>>,
    steps: Arc<RwLock<StepRegistry>>,
    processor: Arc<MessageProcessor>,
    health: Arc<HealthRendezvous>,
}

impl Runtime {
    pub fn new(world: World) -> Self {
        Self::with_config(world, RuntimeConfig::default())
    }

    pub fn with_config(world: World, config: RuntimeConfig) -> Self {
        Self::with_class_registry(world, config, None)
    }

    /// Use an isolated class registry for this runtime's replay contexts;
    /// the process-wide registry remains the fallback.
    pub fn with_class_registry(
        world: World,
        config: RuntimeConfig,
        local_classes: Option<Arc<ClassRegistry>>,
    ) -> Self {
        let workflows = Arc::new(RwLock::new(WorkflowRegistry::new()));
        let steps = Arc::new(RwLock::new(StepRegistry::new()));
        let health = Arc::new(HealthRendezvous::new());

        let processor = Arc::new(MessageProcessor::new(
            world.clone(),
            Arc::clone(&workflows),
            Arc::clone(&steps),
            config.processor,
            config.streamer,
            Arc::clone(&health),
            local_classes,
        ));

        Self {
            world,
            workflows,
            steps,
            processor,
            health,
        }
    }

    pub fn register_workflow<W: Workflow + Default>(&self) {
        self.workflows.write().register::<W>();
        info!(workflow = W::NAME, "registered workflow");
    }

    pub fn register_step<S: Step + Default>(&self) {
        self.steps.write().register::<S>();
        info!(step = S::NAME, "registered step");
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    // =========================================================================
    // Run control
    // =========================================================================

    /// Start a new run of a registered workflow.
    #[instrument(skip(self, input, options), fields(workflow = W::NAME))]
    pub async fn start<W: Workflow + Default>(
        &self,
        input: W::Input,
        options: StartOptions,
    ) -> Result<RunId, RuntimeError> {
        let args = to_args(serde_json::to_value(input)?);
        self.start_by_name(W::NAME, args, options).await
    }

    /// Start a run by workflow name with a raw argument sequence.
    pub async fn start_by_name(
        &self,
        workflow_name: &str,
        input: Vec<Value>,
        options: StartOptions,
    ) -> Result<RunId, RuntimeError> {
        let expires_at = options
            .expires_in
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);

        let appended = self
            .world
            .storage
            .events_create(
                None,
                NewEvent::new(
                    CorrelationId::from(""),
                    EventPayload::RunCreated {
                        workflow_name: workflow_name.to_string(),
                        input,
                        trace_carrier: options.trace_carrier.clone(),
                        expires_at,
                    },
                ),
            )
            .await?;

        let run_id = appended.event.run_id.clone();
        info!(%run_id, workflow_name, "run created");

        self.world
            .queue
            .send(
                QueueMessage::WorkflowTick {
                    run_id: run_id.clone(),
                    trace_carrier: options.trace_carrier,
                },
                SendOptions::default(),
            )
            .await?;

        Ok(run_id)
    }

    /// Cancel a run. Subsequent messages for it ack without side effects;
    /// an in-flight step may finish but its result is ignored.
    pub async fn cancel(
        &self,
        run_id: &RunId,
        reason: Option<String>,
    ) -> Result<(), RuntimeError> {
        let result = self
            .world
            .storage
            .events_create(
                Some(run_id),
                NewEvent::new(
                    CorrelationId::run(run_id),
                    EventPayload::RunCancelled { reason },
                ),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already terminal: cancellation is a no-op.
            Err(error) if error.is_conflict() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Wake a sleeping workflow early by completing its wait now.
    pub async fn wake(
        &self,
        run_id: &RunId,
        correlation_id: &CorrelationId,
    ) -> Result<(), RuntimeError> {
        let result = self
            .world
            .storage
            .events_create(
                Some(run_id),
                NewEvent::new(correlation_id.clone(), EventPayload::WaitCompleted),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                debug!(%correlation_id, "wait already completed");
            }
            Err(error) => return Err(error.into()),
        }

        self.enqueue_tick(run_id).await
    }

    /// Deliver a payload to a hook by its token.
    pub async fn resume_hook(&self, token: &str, payload: Value) -> Result<(), RuntimeError> {
        let hook = self.world.storage.hook_get_by_token(token).await?;
        if hook.is_disposed() {
            return Err(RuntimeError::HookDisposed(hook.hook_id.to_string()));
        }

        self.world
            .storage
            .events_create(
                Some(&hook.run_id),
                NewEvent::new(
                    hook.hook_id.correlation(),
                    EventPayload::HookReceived { payload },
                ),
            )
            .await?;

        self.enqueue_tick(&hook.run_id).await
    }

    /// Dispose a hook early; later deliveries are rejected.
    pub async fn dispose_hook(&self, token: &str) -> Result<(), RuntimeError> {
        let hook = self.world.storage.hook_get_by_token(token).await?;
        let result = self
            .world
            .storage
            .events_create(
                Some(&hook.run_id),
                NewEvent::new(hook.hook_id.correlation(), EventPayload::HookDisposed),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                debug!(hook_id = %hook.hook_id, "hook already disposed");
            }
            Err(error) => return Err(error.into()),
        }

        self.enqueue_tick(&hook.run_id).await
    }

    /// Read a run's stream from the given chunk index.
    pub async fn read_stream(
        &self,
        run_id: &RunId,
        stream: &StreamRef,
        start_index: u64,
    ) -> Result<ChunkStream, RuntimeError> {
        Ok(self
            .world
            .streamer
            .read_from_stream(run_id, &stream.stream_name, start_index)
            .await?)
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Probe one queue endpoint end-to-end.
    ///
    /// Something must be draining the queue concurrently ([`Runtime::serve`])
    /// or the probe times out.
    pub async fn health_check(
        &self,
        endpoint: HealthEndpoint,
        timeout: Duration,
    ) -> HealthReport {
        HealthChecker::new(Arc::clone(&self.world.queue), Arc::clone(&self.health))
            .check(endpoint, timeout)
            .await
    }

    /// Process messages until the broker is empty.
    ///
    /// Waits out delayed messages (retry backoff, timers), so a run driven
    /// by this method settles completely unless it is parked on an external
    /// rendez-vous (hook delivery).
    pub async fn run_until_idle(&self) {
        loop {
            let mut progressed = false;
            for queue_name in [queues::WORKFLOW, queues::STEP] {
                while let Some(delivery) = self.pop(queue_name).await {
                    self.dispatch(delivery).await;
                    progressed = true;
                }
            }

            if progressed {
                continue;
            }

            match self.world.queue.next_visible_at() {
                None => break,
                Some(at) => {
                    let wait = (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(Duration::from_millis(50));
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Long-running worker loop with graceful shutdown.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) {
        info!("worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut progressed = false;
            for queue_name in [queues::WORKFLOW, queues::STEP] {
                if let Some(delivery) = self.pop(queue_name).await {
                    self.dispatch(delivery).await;
                    progressed = true;
                }
            }

            if !progressed {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        }
        info!("worker loop stopped");
    }

    async fn pop(&self, queue_name: &str) -> Option<Delivery> {
        match self.world.queue.pop(queue_name).await {
            Ok(delivery) => delivery,
            Err(error) => {
                warn!(queue_name, %error, "queue pop failed");
                None
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let outcome = self.processor.handle(&delivery).await;
        let result = match outcome {
            HandlerOutcome::Ack => self.world.queue.ack(&delivery.meta.message_id).await,
            HandlerOutcome::Retry(delay) => {
                self.world.queue.extend(&delivery.meta.message_id, delay).await
            }
        };
        if let Err(error) = result {
            warn!(message_id = %delivery.meta.message_id, %error, "queue settle failed");
        }
    }

    async fn enqueue_tick(&self, run_id: &RunId) -> Result<(), RuntimeError> {
        let run = self.world.storage.run_get(run_id).await?;
        self.world
            .queue
            .send(
                QueueMessage::WorkflowTick {
                    run_id: run_id.clone(),
                    trace_carrier: run.trace_carrier,
                },
                SendOptions::default(),
            )
            .await?;
        Ok(())
    }
}

/// Normalize a serialized input into the run's argument sequence.
fn to_args(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => vec![],
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_args_normalization() {
        assert_eq!(
            to_args(serde_json::json!([1, 2])),
            vec![serde_json::json!(1), serde_json::json!(2)]
        );
        assert_eq!(to_args(Value::Null), Vec::<Value>::new());
        assert_eq!(to_args(serde_json::json!(7)), vec![serde_json::json!(7)]);
    }
}
