//! Message processor
//!
//! The single entry point for every queue message. Workflow ticks drive one
//! replay pass; step executions run one attempt of a step body; timer fires
//! complete waits; health probes resolve their rendez-vous. The processor
//! never lets an error escape to the queue dispatcher: every message is
//! either acked or deliberately left for redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use windlass_core::{
    codec::ClassRegistry, codes, generate_token, CorrelationId, ErrorInfo, Event, EventPayload,
    NewEvent, QueueMessage, Run, RunId, StepId,
};
use windlass_storage::{
    Delivery, ListByCorrelationParams, ListEventsParams, MessageMeta, QueueError, SendOptions,
    SortOrder, StorageError, World,
};

use crate::context::{Interrupt, WorkflowContext};
use crate::health::HealthRendezvous;
use crate::invocations::Invocation;
use crate::step::{AnyStep, StepContext, StepError, StepRegistry};
use crate::streams::StreamerConfig;
use crate::workflow::{AnyWorkflow, WorkflowRegistry};

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Upper bound on a run's log before the run is failed outright.
    pub max_events_per_run: usize,

    /// Safety margin kept below the broker's maximum message age; messages
    /// older than `max_age - buffer` are re-enqueued fresh instead of being
    /// processed against a dying clock.
    pub ttl_safety_buffer: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10_000,
            ttl_safety_buffer: Duration::from_secs(300),
        }
    }
}

impl ProcessorConfig {
    pub fn with_max_events_per_run(mut self, max: usize) -> Self {
        self.max_events_per_run = max;
        self
    }

    pub fn with_ttl_safety_buffer(mut self, buffer: Duration) -> Self {
        self.ttl_safety_buffer = buffer;
        self
    }
}

/// What the dispatcher should do with the message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Remove the message.
    Ack,

    /// Leave the message in flight; it redelivers after the given delay.
    Retry(Duration),
}

fn retry_later() -> HandlerOutcome {
    HandlerOutcome::Retry(Duration::from_secs(5))
}

#[derive(Debug, thiserror::Error)]
enum ProcessorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Queue-driven dispatch over one [`World`].
pub struct MessageProcessor {
    world: World,
    workflows: Arc<RwLock<WorkflowRegistry>>,
    steps: Arc<RwLock<StepRegistry>>,
    config: ProcessorConfig,
    stream_config: StreamerConfig,
    health: Arc<HealthRendezvous>,
    local_classes: Option<Arc<ClassRegistry>>,
}

impl MessageProcessor {
    pub(crate) fn new(
        world: World,
        workflows: Arc<RwLock<WorkflowRegistry>>,
        steps: Arc<RwLock<StepRegistry>>,
        config: ProcessorConfig,
        stream_config: StreamerConfig,
        health: Arc<HealthRendezvous>,
        local_classes: Option<Arc<ClassRegistry>>,
    ) -> Self {
        Self {
            world,
            workflows,
            steps,
            config,
            stream_config,
            health,
            local_classes,
        }
    }

    /// Handle one delivery. Never errors outward.
    #[instrument(skip(self, delivery), fields(message_id = %delivery.meta.message_id))]
    pub async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        // A message close to the broker's maximum age is re-enqueued with a
        // fresh broker-side age instead of being processed on borrowed time.
        if self.near_broker_ttl(&delivery.meta) {
            return self.reenqueue_fresh(&delivery.message).await;
        }

        match &delivery.message {
            QueueMessage::WorkflowTick { run_id, .. } => self.process_tick(run_id).await,
            QueueMessage::StepExecute {
                run_id,
                step_id,
                step_name,
                input,
                attempt,
                ..
            } => {
                self.process_step(run_id, step_id, step_name, input, *attempt)
                    .await
            }
            QueueMessage::TimerFire {
                run_id,
                correlation_id,
                resume_at,
                ..
            } => self.process_timer(run_id, correlation_id, *resume_at).await,
            QueueMessage::HealthCheck { nonce, endpoint } => {
                debug!(%endpoint, nonce = %nonce, "health probe");
                self.health.resolve(nonce);
                HandlerOutcome::Ack
            }
        }
    }

    // =========================================================================
    // Workflow ticks
    // =========================================================================

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn process_tick(&self, run_id: &RunId) -> HandlerOutcome {
        let run = match self.world.storage.run_get(run_id).await {
            Ok(run) => run,
            Err(StorageError::RunNotFound(_)) => {
                warn!(%run_id, "tick for unknown run");
                return HandlerOutcome::Ack;
            }
            Err(error) => {
                warn!(%run_id, %error, "run fetch failed, leaving tick for redelivery");
                return retry_later();
            }
        };

        if run.status.is_terminal() {
            debug!(%run_id, status = %run.status, "run already terminal");
            return HandlerOutcome::Ack;
        }
        if run.is_expired(Utc::now()) {
            info!(%run_id, "run expired, dropping tick");
            return HandlerOutcome::Ack;
        }

        let events = match self.load_events(run_id).await {
            Ok(events) => events,
            Err(error) => {
                warn!(%run_id, %error, "event load failed");
                return retry_later();
            }
        };

        if events.len() > self.config.max_events_per_run {
            let error = ErrorInfo::new(format!(
                "event log exceeds {} events",
                self.config.max_events_per_run
            ));
            return self.fail_run(&run, error).await;
        }

        if !matches!(
            events.first().map(|e| &e.payload),
            Some(EventPayload::RunCreated { .. })
        ) {
            let error = ErrorInfo::new("first event must be run_created")
                .with_code(codes::WORKFLOW_RUNTIME_ERROR);
            return self.fail_run(&run, error).await;
        }

        let workflow = self.workflows.read().get(&run.workflow_name);
        let Some(workflow) = workflow else {
            return self
                .fail_run(&run, WorkflowRegistry::unknown_workflow_error(&run.workflow_name))
                .await;
        };

        let mut ctx =
            WorkflowContext::new(&run, events[1..].to_vec(), self.local_classes.clone());

        match workflow.run(&mut ctx, &run.input) {
            Err(Interrupt::Suspended) => {
                debug!(%run_id, pending = ctx.invocations().len(), "replay suspended");
                if let Err(error) = self.flush(&run, &ctx).await {
                    warn!(%run_id, %error, "flush failed, leaving tick for redelivery");
                    return retry_later();
                }
                HandlerOutcome::Ack
            }
            Ok(output) => {
                // Spawned-but-unjoined invocations still flush; completion
                // waits until every outstanding correlation has a terminal
                // event in the log.
                if let Err(error) = self.flush(&run, &ctx).await {
                    warn!(%run_id, %error, "flush failed, leaving tick for redelivery");
                    return retry_later();
                }
                let outstanding = ctx
                    .invocations()
                    .entries()
                    .any(|entry| !ctx.consumer().has_terminal_for(&entry.correlation_id));
                if outstanding {
                    debug!(%run_id, "body returned with outstanding invocations, deferring completion");
                    return HandlerOutcome::Ack;
                }

                info!(%run_id, "workflow completed");
                match self
                    .append(
                        &run.run_id,
                        CorrelationId::run(&run.run_id),
                        EventPayload::RunCompleted { output },
                    )
                    .await
                {
                    Ok(_) => HandlerOutcome::Ack,
                    Err(error) => {
                        warn!(%run_id, %error, "completion append failed");
                        retry_later()
                    }
                }
            }
            Err(Interrupt::Failed(error)) => self.fail_run(&run, error).await,
            Err(Interrupt::Runtime(mut error)) => {
                if error.code.is_none() {
                    error = error.with_code(codes::WORKFLOW_RUNTIME_ERROR);
                }
                self.fail_run(&run, error).await
            }
        }
    }

    /// Drain the invocations queue: append creation events and enqueue
    /// side-effect messages. Safe to repeat — creation appends are guarded
    /// by the log and message sends by idempotency keys.
    async fn flush(&self, run: &Run, ctx: &WorkflowContext) -> Result<(), ProcessorError> {
        for entry in ctx.invocations().entries() {
            let correlation_id = entry.correlation_id.clone();
            match &entry.invocation {
                Invocation::Step {
                    step_id,
                    step_name,
                    input,
                } => {
                    if entry.retry_observed {
                        // The retry scheduler owns this step's messages now.
                        continue;
                    }
                    if !entry.acknowledged
                        && self.correlation_is_unborn(run, &correlation_id).await?
                    {
                        self.append(
                            &run.run_id,
                            correlation_id.clone(),
                            EventPayload::StepStarted {
                                step_name: step_name.clone(),
                                input: input.clone(),
                                attempt: 1,
                            },
                        )
                        .await?;
                    }

                    let message = QueueMessage::StepExecute {
                        run_id: run.run_id.clone(),
                        step_id: step_id.clone(),
                        step_name: step_name.clone(),
                        input: input.clone(),
                        attempt: 1,
                        trace_carrier: run.trace_carrier.clone(),
                    };
                    self.send(message).await?;
                }
                Invocation::Wait { duration, resume_at } => {
                    let resume_at = match (entry.acknowledged, resume_at) {
                        (true, Some(deadline)) => *deadline,
                        (true, None) => continue,
                        (false, _) => {
                            // Server-assigned: recorded at flush time, read
                            // back from the event on later replays.
                            match self.recorded_resume_at(run, &correlation_id).await? {
                                Some(deadline) => deadline,
                                None => {
                                    let deadline = Utc::now()
                                        + chrono::Duration::from_std(*duration)
                                            .unwrap_or_else(|_| chrono::Duration::zero());
                                    self.append(
                                        &run.run_id,
                                        correlation_id.clone(),
                                        EventPayload::WaitCreated {
                                            resume_at: deadline,
                                        },
                                    )
                                    .await?;
                                    deadline
                                }
                            }
                        }
                    };

                    let delay = (resume_at - Utc::now()).to_std().unwrap_or_default();
                    let message = QueueMessage::TimerFire {
                        run_id: run.run_id.clone(),
                        correlation_id: correlation_id.clone(),
                        resume_at,
                        trace_carrier: run.trace_carrier.clone(),
                    };
                    self.send_delayed(message, self.clamp_delay(delay)).await?;
                }
                Invocation::Hook { metadata, policy } => {
                    if entry.acknowledged {
                        continue;
                    }
                    if self.correlation_is_unborn(run, &correlation_id).await? {
                        self.append(
                            &run.run_id,
                            correlation_id.clone(),
                            EventPayload::HookCreated {
                                token: generate_token(),
                                metadata: metadata.clone(),
                                policy: *policy,
                            },
                        )
                        .await?;
                    }
                    // Hooks are resolved out-of-band by token; there is no
                    // side-effect message to enqueue.
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Step executions
    // =========================================================================

    #[instrument(skip(self, input), fields(run_id = %run_id, step_id = %step_id, attempt))]
    async fn process_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        step_name: &str,
        input: &[Value],
        attempt: u32,
    ) -> HandlerOutcome {
        let run = match self.world.storage.run_get(run_id).await {
            Ok(run) => run,
            Err(StorageError::RunNotFound(_)) => {
                warn!(%run_id, "step execution for unknown run");
                return HandlerOutcome::Ack;
            }
            Err(error) => {
                warn!(%run_id, %error, "run fetch failed");
                return retry_later();
            }
        };

        // Cancelled/terminal/expired runs discard step work silently.
        if run.status.is_terminal() || run.is_expired(Utc::now()) {
            debug!(%run_id, %step_id, "dropping step execution for inactive run");
            return HandlerOutcome::Ack;
        }

        let correlation_id = step_id.correlation();
        let existing = match self.correlation_events(run_id, &correlation_id).await {
            Ok(events) => events,
            Err(error) => {
                warn!(%run_id, %error, "correlation scan failed");
                return retry_later();
            }
        };

        // Idempotency: an already-recorded outcome makes redelivery a no-op.
        if existing.iter().any(|event| {
            matches!(
                event.payload,
                EventPayload::StepCompleted { .. } | EventPayload::StepFailed { .. }
            )
        }) {
            debug!(%step_id, "step outcome already recorded");
            return HandlerOutcome::Ack;
        }

        let step = self.steps.read().get(step_name);
        let Some(step) = step else {
            let error = ErrorInfo::new(format!("step not registered: {step_name}"))
                .with_code(codes::STEP_NOT_REGISTERED);
            return self.fail_step(&run, &correlation_id, error).await;
        };
        let policy = step.retry_policy();

        let already_started = existing.iter().any(|event| {
            matches!(&event.payload, EventPayload::StepStarted { attempt: a, .. } if *a == attempt)
        });
        if !already_started {
            let append = self
                .append(
                    run_id,
                    correlation_id.clone(),
                    EventPayload::StepStarted {
                        step_name: step_name.to_string(),
                        input: input.to_vec(),
                        attempt,
                    },
                )
                .await;
            if let Err(error) = append {
                warn!(%step_id, %error, "step_started append failed");
                return retry_later();
            }
        }

        let ctx = StepContext::new(
            run_id.clone(),
            step_id.clone(),
            attempt,
            policy.max_attempts,
            Arc::clone(&self.world.streamer),
            self.stream_config.clone(),
        );

        let result = step.execute(&ctx, input.to_vec()).await;

        // Streams produced by the step close before its completion event is
        // observable.
        let result = match (result, ctx.seal_streams().await) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(error)) => Err(StepError::retryable(format!(
                "stream seal failed: {error}"
            ))),
            (Err(error), _) => Err(error),
        };

        match result {
            Ok(output) => {
                if let Err(error) = self
                    .append(
                        run_id,
                        correlation_id.clone(),
                        EventPayload::StepCompleted { output },
                    )
                    .await
                {
                    warn!(%step_id, %error, "completion append failed");
                    return retry_later();
                }
                self.enqueue_tick(&run).await
            }
            Err(step_error) => {
                self.schedule_failure(&run, &correlation_id, step_name, input, attempt, &policy, step_error)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn schedule_failure(
        &self,
        run: &Run,
        correlation_id: &CorrelationId,
        step_name: &str,
        input: &[Value],
        attempt: u32,
        policy: &windlass_core::RetryPolicy,
        step_error: StepError,
    ) -> HandlerOutcome {
        let may_retry = step_error.retryable && policy.should_retry(step_error.code.as_deref());

        if may_retry && policy.has_attempts_remaining(attempt) {
            let next_attempt = attempt + 1;
            let retry_after = policy.retry_after(next_attempt, Utc::now());
            info!(%correlation_id, attempt, %retry_after, "scheduling step retry");

            let appended = self
                .append(
                    &run.run_id,
                    correlation_id.clone(),
                    EventPayload::StepRetrying {
                        attempt,
                        retry_after,
                        error: step_error.clone().into(),
                    },
                )
                .await;
            if let Err(error) = appended {
                warn!(%correlation_id, %error, "retry append failed");
                return retry_later();
            }

            let delay = (retry_after - Utc::now()).to_std().unwrap_or_default();
            let message = QueueMessage::StepExecute {
                run_id: run.run_id.clone(),
                step_id: correlation_id.as_step_id(),
                step_name: step_name.to_string(),
                input: input.to_vec(),
                attempt: next_attempt,
                trace_carrier: run.trace_carrier.clone(),
            };
            match self.send_delayed(message, self.clamp_delay(delay)).await {
                Ok(()) => HandlerOutcome::Ack,
                Err(error) => {
                    warn!(%correlation_id, %error, "retry enqueue failed");
                    retry_later()
                }
            }
        } else {
            let mut error: ErrorInfo = step_error.into();
            if may_retry && error.code.is_none() {
                error = error.with_code(codes::RETRY_EXHAUSTED);
            }
            self.fail_step(run, correlation_id, error).await
        }
    }

    async fn fail_step(
        &self,
        run: &Run,
        correlation_id: &CorrelationId,
        error: ErrorInfo,
    ) -> HandlerOutcome {
        if let Err(append_error) = self
            .append(
                &run.run_id,
                correlation_id.clone(),
                EventPayload::StepFailed { error },
            )
            .await
        {
            warn!(%correlation_id, %append_error, "failure append failed");
            return retry_later();
        }
        self.enqueue_tick(run).await
    }

    // =========================================================================
    // Timer fires
    // =========================================================================

    #[instrument(skip(self), fields(run_id = %run_id, correlation_id = %correlation_id))]
    async fn process_timer(
        &self,
        run_id: &RunId,
        correlation_id: &CorrelationId,
        resume_at: chrono::DateTime<Utc>,
    ) -> HandlerOutcome {
        let run = match self.world.storage.run_get(run_id).await {
            Ok(run) => run,
            Err(StorageError::RunNotFound(_)) => return HandlerOutcome::Ack,
            Err(error) => {
                warn!(%run_id, %error, "run fetch failed");
                return retry_later();
            }
        };
        if run.status.is_terminal() {
            return HandlerOutcome::Ack;
        }

        let now = Utc::now();
        if now < resume_at {
            // Fired early (TTL-clamped delay): re-enqueue with the
            // remaining wait and a fresh broker-side age.
            let remaining = (resume_at - now).to_std().unwrap_or_default();
            debug!(%correlation_id, ?remaining, "timer not due yet, re-enqueueing");
            let message = QueueMessage::TimerFire {
                run_id: run_id.clone(),
                correlation_id: correlation_id.clone(),
                resume_at,
                trace_carrier: run.trace_carrier.clone(),
            };
            return match self
                .world
                .queue
                .send(
                    message,
                    SendOptions::default().with_delay(self.clamp_delay(remaining)),
                )
                .await
            {
                Ok(_) => HandlerOutcome::Ack,
                Err(error) => {
                    warn!(%correlation_id, %error, "timer re-enqueue failed");
                    retry_later()
                }
            };
        }

        if let Err(error) = self
            .append(run_id, correlation_id.clone(), EventPayload::WaitCompleted)
            .await
        {
            warn!(%correlation_id, %error, "wait completion append failed");
            return retry_later();
        }
        self.enqueue_tick(&run).await
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    fn near_broker_ttl(&self, meta: &MessageMeta) -> bool {
        let age = (Utc::now() - meta.created_at).to_std().unwrap_or_default();
        age + self.config.ttl_safety_buffer >= self.world.queue.max_message_age()
    }

    /// Re-enqueue the same logical payload under a fresh broker-side age.
    async fn reenqueue_fresh(&self, message: &QueueMessage) -> HandlerOutcome {
        info!("message near broker TTL, re-enqueueing fresh copy");
        match self
            .world
            .queue
            .send(message.clone(), SendOptions::default())
            .await
        {
            Ok(_) => HandlerOutcome::Ack,
            Err(error) => {
                warn!(%error, "ttl re-enqueue failed");
                retry_later()
            }
        }
    }

    fn clamp_delay(&self, delay: Duration) -> Duration {
        let allowance = self
            .world
            .queue
            .max_message_age()
            .saturating_sub(self.config.ttl_safety_buffer);
        delay.min(allowance)
    }

    async fn load_events(&self, run_id: &RunId) -> Result<Vec<Event>, StorageError> {
        let mut events = vec![];
        let mut cursor = None;
        loop {
            let page = self
                .world
                .storage
                .events_list(ListEventsParams {
                    run_id: run_id.clone(),
                    cursor,
                    limit: Some(500),
                    order: SortOrder::Asc,
                })
                .await?;
            events.extend(page.items);
            if !page.has_more {
                break;
            }
            cursor = page.cursor;
        }
        Ok(events)
    }

    async fn correlation_events(
        &self,
        run_id: &RunId,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<Event>, StorageError> {
        let page = self
            .world
            .storage
            .events_list_by_correlation_id(ListByCorrelationParams {
                run_id: run_id.clone(),
                correlation_id: correlation_id.clone(),
                cursor: None,
                limit: Some(1000),
                order: SortOrder::Asc,
            })
            .await?;
        Ok(page.items)
    }

    /// True when no event exists yet for the correlation.
    async fn correlation_is_unborn(
        &self,
        run: &Run,
        correlation_id: &CorrelationId,
    ) -> Result<bool, StorageError> {
        let page = self
            .world
            .storage
            .events_list_by_correlation_id(ListByCorrelationParams {
                run_id: run.run_id.clone(),
                correlation_id: correlation_id.clone(),
                cursor: None,
                limit: Some(1),
                order: SortOrder::Asc,
            })
            .await?;
        Ok(page.items.is_empty())
    }

    async fn recorded_resume_at(
        &self,
        run: &Run,
        correlation_id: &CorrelationId,
    ) -> Result<Option<chrono::DateTime<Utc>>, StorageError> {
        let events = self.correlation_events(&run.run_id, correlation_id).await?;
        Ok(events.iter().find_map(|event| match &event.payload {
            EventPayload::WaitCreated { resume_at } => Some(*resume_at),
            _ => None,
        }))
    }

    /// Append one event, treating a terminal-uniqueness conflict as
    /// somebody-already-did-it.
    async fn append(
        &self,
        run_id: &RunId,
        correlation_id: CorrelationId,
        payload: EventPayload,
    ) -> Result<bool, StorageError> {
        match self
            .world
            .storage
            .events_create(Some(run_id), NewEvent::new(correlation_id, payload))
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if error.is_conflict() => {
                debug!("append conflict treated as already done");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    async fn send(&self, message: QueueMessage) -> Result<(), QueueError> {
        let options = match message.idempotency_key() {
            Some(key) => SendOptions::default().with_idempotency_key(key),
            None => SendOptions::default(),
        };
        self.world.queue.send(message, options).await.map(|_| ())
    }

    async fn send_delayed(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let options = match message.idempotency_key() {
            Some(key) => SendOptions::default().with_idempotency_key(key),
            None => SendOptions::default(),
        }
        .with_delay(delay);
        self.world.queue.send(message, options).await.map(|_| ())
    }

    async fn enqueue_tick(&self, run: &Run) -> HandlerOutcome {
        let message = QueueMessage::WorkflowTick {
            run_id: run.run_id.clone(),
            trace_carrier: run.trace_carrier.clone(),
        };
        match self.world.queue.send(message, SendOptions::default()).await {
            Ok(_) => HandlerOutcome::Ack,
            Err(error) => {
                warn!(run_id = %run.run_id, %error, "tick enqueue failed");
                retry_later()
            }
        }
    }

    async fn fail_run(&self, run: &Run, error: ErrorInfo) -> HandlerOutcome {
        warn!(run_id = %run.run_id, %error, "failing run");
        match self
            .append(
                &run.run_id,
                CorrelationId::run(&run.run_id),
                EventPayload::RunFailed { error },
            )
            .await
        {
            Ok(_) => HandlerOutcome::Ack,
            Err(append_error) => {
                warn!(run_id = %run.run_id, %append_error, "run failure append failed");
                retry_later()
            }
        }
    }
}
