//! Orchestrator VM context
//!
//! A [`WorkflowContext`] is built fresh for every tick and re-executes the
//! workflow body against the run's event log. Its environment is
//! deterministic: the clock is frozen at run start, the RNG is seeded from
//! the run ID, and correlation IDs come from a monotonic ULID factory over
//! that RNG — so the Nth primitive reach produces the same correlation ID
//! on every replay.
//!
//! Every durable primitive follows one protocol: generate the correlation
//! ID, claim its creation event (or register a provisional invocation on
//! first reach), then claim matching events until resolved or the log runs
//! dry. Exhaustion surfaces as [`Interrupt::Suspended`], which the body
//! bubbles up with `?` and only the tick driver catches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use ulid::Ulid;

use windlass_core::{
    codec::{self, ClassRegistry, Revived, StreamRef},
    codes, CorrelationId, ErrorInfo, Event, EventPayload, HookId, HookPolicy, Run, RunId,
    UlidFactory,
};

use crate::consumer::EventsConsumer;
use crate::invocations::{Invocation, InvocationsQueue};

/// Control-flow interrupt bubbled out of a workflow body.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// The event log is exhausted mid-wait. Not an error: the tick driver
    /// flushes the invocations queue and stops. Workflow bodies must
    /// propagate it.
    Suspended,

    /// A primitive was rejected (step failed terminally, hook disposed).
    /// The body may catch this and continue; uncaught, the run fails with
    /// the carried error.
    Failed(ErrorInfo),

    /// The event log contradicts the replayed body. Terminal for the run.
    Runtime(ErrorInfo),
}

impl Interrupt {
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended)
    }

    /// The rejection error, when this interrupt is catchable.
    pub fn as_failure(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Handle to a spawned (possibly still executing) step.
#[derive(Debug, Clone)]
pub struct StepHandle {
    pub(crate) correlation_id: CorrelationId,
}

impl StepHandle {
    pub fn step_id(&self) -> windlass_core::StepId {
        self.correlation_id.as_step_id()
    }
}

/// Handle to a created hook, resolvable out-of-band via its token.
#[derive(Debug, Clone)]
pub struct HookHandle {
    pub hook_id: HookId,
    pub token: String,
    pub policy: HookPolicy,
    pub(crate) correlation_id: CorrelationId,
}

/// Options for [`WorkflowContext::create_hook`].
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    pub metadata: Option<Value>,
    pub policy: HookPolicy,
}

impl HookOptions {
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_policy(mut self, policy: HookPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// The deterministic execution context handed to workflow bodies.
pub struct WorkflowContext {
    run_id: RunId,
    workflow_name: String,
    now: DateTime<Utc>,
    ids: UlidFactory,
    consumer: EventsConsumer,
    invocations: InvocationsQueue,
    local_classes: Option<Arc<ClassRegistry>>,
}

impl WorkflowContext {
    /// Build the context for one tick.
    ///
    /// `events` is the log prefix with the leading `run_created` already
    /// stripped by the driver.
    pub(crate) fn new(
        run: &Run,
        events: Vec<Event>,
        local_classes: Option<Arc<ClassRegistry>>,
    ) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_name: run.workflow_name.clone(),
            now: run.started_at,
            ids: UlidFactory::deterministic(&run.run_id, run.started_at),
            consumer: EventsConsumer::new(events),
            invocations: InvocationsQueue::new(),
            local_classes,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    /// The frozen clock: always the timestamp captured at run start.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Seeded randomness in `[0, 1)`; identical on every replay.
    pub fn random(&mut self) -> f64 {
        self.ids.random()
    }

    /// A replay-stable ULID, for user-level identifiers.
    pub fn next_ulid(&mut self) -> Ulid {
        self.ids.next()
    }

    // =========================================================================
    // Step primitive
    // =========================================================================

    /// Execute a durable step and wait for its result.
    pub fn step(&mut self, step_name: &str, input: Vec<Value>) -> Result<Value, Interrupt> {
        let handle = self.spawn_step(step_name, input)?;
        self.join_step(&handle)
    }

    /// Dispatch a durable step without waiting.
    ///
    /// Correlation IDs are assigned at spawn-site order, so handles created
    /// before a later suspension keep their identity across replays.
    pub fn spawn_step(
        &mut self,
        step_name: &str,
        input: Vec<Value>,
    ) -> Result<StepHandle, Interrupt> {
        let correlation_id = CorrelationId::step(self.ids.next());
        let invocation = Invocation::Step {
            step_id: correlation_id.as_step_id(),
            step_name: step_name.to_string(),
            input,
        };

        match self.consumer.claim_next() {
            None => {
                // First reach: request the side effect through the flush.
                self.invocations.insert(correlation_id.clone(), invocation);
            }
            Some(event) => match &event.payload {
                EventPayload::StepStarted {
                    step_name: recorded,
                    ..
                } if event.correlation_id == correlation_id => {
                    if recorded != step_name {
                        return Err(self.divergence(
                            &correlation_id,
                            &format!("step name was {recorded:?}, replay reached {step_name:?}"),
                        ));
                    }
                    self.invocations
                        .insert_acknowledged(correlation_id.clone(), invocation);
                }
                _ => return Err(self.corrupted(&correlation_id, "step_started", &event)),
            },
        }

        Ok(StepHandle { correlation_id })
    }

    /// Wait for a spawned step's terminal event.
    pub fn join_step(&mut self, handle: &StepHandle) -> Result<Value, Interrupt> {
        loop {
            let Some(event) = self.consumer.claim_next_matching(&handle.correlation_id) else {
                return Err(Interrupt::Suspended);
            };

            match event.payload {
                // Retry cycles replay silently; the recorded outcome is all
                // the body observes.
                EventPayload::StepRetrying { .. } => {
                    self.invocations.mark_retry_observed(&handle.correlation_id);
                }
                EventPayload::StepStarted { .. } => {}
                EventPayload::StepCompleted { output } => {
                    self.invocations.resolve(&handle.correlation_id);
                    return Ok(self.materialize(output));
                }
                EventPayload::StepFailed { error } => {
                    self.invocations.resolve(&handle.correlation_id);
                    return Err(Interrupt::Failed(error));
                }
                _ => {
                    return Err(self.corrupted(
                        &handle.correlation_id,
                        "step_completed|step_failed",
                        &event,
                    ))
                }
            }
        }
    }

    // =========================================================================
    // Sleep primitive
    // =========================================================================

    /// Durably sleep for `duration`.
    ///
    /// The actual deadline is server-assigned when the wait is flushed and
    /// read back from the `wait_created` event on later replays.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let correlation_id = CorrelationId::wait(self.ids.next());

        match self.consumer.claim_next() {
            None => {
                self.invocations.insert(
                    correlation_id,
                    Invocation::Wait {
                        duration,
                        resume_at: None,
                    },
                );
                return Err(Interrupt::Suspended);
            }
            Some(event) => match &event.payload {
                EventPayload::WaitCreated { resume_at }
                    if event.correlation_id == correlation_id =>
                {
                    self.invocations.insert_acknowledged(
                        correlation_id.clone(),
                        Invocation::Wait {
                            duration,
                            resume_at: Some(*resume_at),
                        },
                    );
                }
                _ => return Err(self.corrupted(&correlation_id, "wait_created", &event)),
            },
        }

        match self.consumer.claim_next_matching(&correlation_id) {
            None => Err(Interrupt::Suspended),
            Some(event) => match event.payload {
                EventPayload::WaitCompleted => {
                    self.invocations.resolve(&correlation_id);
                    Ok(())
                }
                _ => Err(self.corrupted(&correlation_id, "wait_completed", &event)),
            },
        }
    }

    // =========================================================================
    // Hook primitive
    // =========================================================================

    /// Create a durable rendez-vous point.
    ///
    /// Suspends on first reach: the token is minted with real entropy at
    /// flush time and resolved from the `hook_created` event on the next
    /// tick.
    pub fn create_hook(&mut self, options: HookOptions) -> Result<HookHandle, Interrupt> {
        let correlation_id = CorrelationId::hook(self.ids.next());

        match self.consumer.claim_next() {
            None => {
                self.invocations.insert(
                    correlation_id,
                    Invocation::Hook {
                        metadata: options.metadata,
                        policy: options.policy,
                    },
                );
                Err(Interrupt::Suspended)
            }
            Some(event) => match &event.payload {
                EventPayload::HookCreated { token, policy, .. }
                    if event.correlation_id == correlation_id =>
                {
                    Ok(HookHandle {
                        hook_id: correlation_id.as_hook_id(),
                        token: token.clone(),
                        policy: *policy,
                        correlation_id,
                    })
                }
                _ => Err(self.corrupted(&correlation_id, "hook_created", &event)),
            },
        }
    }

    /// Wait for the next unconsumed delivery to a hook.
    ///
    /// With [`HookPolicy::Stream`], repeated calls consume deliveries in
    /// arrival order.
    pub fn recv_hook(&mut self, hook: &HookHandle) -> Result<Value, Interrupt> {
        match self.consumer.claim_next_matching(&hook.correlation_id) {
            None => Err(Interrupt::Suspended),
            Some(event) => match event.payload {
                EventPayload::HookReceived { payload } => Ok(self.materialize(payload)),
                EventPayload::HookDisposed => Err(Interrupt::Failed(
                    ErrorInfo::new(format!("hook {} was disposed", hook.hook_id))
                        .with_code(codes::HOOK_DISPOSED),
                )),
                _ => Err(self.corrupted(
                    &hook.correlation_id,
                    "hook_received|hook_disposed",
                    &event,
                )),
            },
        }
    }

    // =========================================================================
    // Stream primitive
    // =========================================================================

    /// A write-only stream handle whose name is derived deterministically
    /// from the writer's correlation ID plus an optional namespace.
    ///
    /// The handle itself is pure identity; producing happens in steps,
    /// which attach to the name through their own context.
    pub fn get_writable(&mut self, namespace: Option<&str>) -> StreamRef {
        let id = self.ids.next();
        let name = match namespace {
            Some(ns) => format!("{id}:{ns}"),
            None => id.to_string(),
        };
        StreamRef::new(name)
    }

    // =========================================================================
    // Driver interface
    // =========================================================================

    pub(crate) fn invocations(&self) -> &InvocationsQueue {
        &self.invocations
    }

    pub(crate) fn consumer(&self) -> &EventsConsumer {
        &self.consumer
    }

    fn materialize(&self, value: Value) -> Value {
        match codec::revive(&value, self.local_classes.as_deref()) {
            Revived::Instance { value: revived, .. } => revived,
            Revived::Ref(_) | Revived::Plain(_) => value,
        }
    }

    fn corrupted(
        &self,
        correlation_id: &CorrelationId,
        expected: &str,
        found: &Event,
    ) -> Interrupt {
        Interrupt::Runtime(
            ErrorInfo::new(format!(
                "log corrupted: expected {expected} for {correlation_id}, found {} ({})",
                found.event_type(),
                found.correlation_id
            ))
            .with_code(codes::WORKFLOW_RUNTIME_ERROR),
        )
    }

    fn divergence(&self, correlation_id: &CorrelationId, detail: &str) -> Interrupt {
        Interrupt::Runtime(
            ErrorInfo::new(format!("replay divergence at {correlation_id}: {detail}"))
                .with_code(codes::WORKFLOW_RUNTIME_ERROR),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_core::{EventId, RunStatus, TraceCarrier};

    fn test_run() -> Run {
        Run {
            run_id: RunId::generate(),
            workflow_name: "wf".into(),
            status: RunStatus::Running,
            input: vec![],
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            expires_at: None,
            trace_carrier: TraceCarrier::new(),
        }
    }

    fn event(run: &Run, n: u32, correlation: &CorrelationId, payload: EventPayload) -> Event {
        Event {
            event_id: EventId::from(format!("01J{n:023}")),
            run_id: run.run_id.clone(),
            correlation_id: correlation.clone(),
            payload,
            created_at: run.started_at,
        }
    }

    /// The correlation IDs a fresh replay of this run will generate, in
    /// reach order.
    fn correlations(run: &Run, count: usize) -> Vec<Ulid> {
        let mut ids = UlidFactory::deterministic(&run.run_id, run.started_at);
        (0..count).map(|_| ids.next()).collect()
    }

    #[test]
    fn test_first_reach_registers_and_suspends() {
        let run = test_run();
        let mut ctx = WorkflowContext::new(&run, vec![], None);

        let result = ctx.step("add", vec![json!(2), json!(3)]);
        assert!(matches!(result, Err(Interrupt::Suspended)));

        let entries: Vec<_> = ctx.invocations().entries().collect();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].acknowledged);
    }

    #[test]
    fn test_replay_resolves_completed_step() {
        let run = test_run();
        let ulids = correlations(&run, 1);
        let correlation = CorrelationId::step(ulids[0]);

        let events = vec![
            event(
                &run,
                1,
                &correlation,
                EventPayload::StepStarted {
                    step_name: "add".into(),
                    input: vec![json!(2), json!(3)],
                    attempt: 1,
                },
            ),
            event(
                &run,
                2,
                &correlation,
                EventPayload::StepCompleted { output: json!(5) },
            ),
        ];

        let mut ctx = WorkflowContext::new(&run, events, None);
        let result = ctx.step("add", vec![json!(2), json!(3)]).unwrap();
        assert_eq!(result, json!(5));
        assert!(ctx.invocations().is_empty());
    }

    #[test]
    fn test_step_failure_is_catchable() {
        let run = test_run();
        let ulids = correlations(&run, 1);
        let correlation = CorrelationId::step(ulids[0]);

        let events = vec![
            event(
                &run,
                1,
                &correlation,
                EventPayload::StepStarted {
                    step_name: "flaky".into(),
                    input: vec![],
                    attempt: 1,
                },
            ),
            event(
                &run,
                2,
                &correlation,
                EventPayload::StepFailed {
                    error: ErrorInfo::new("gave up"),
                },
            ),
        ];

        let mut ctx = WorkflowContext::new(&run, events, None);
        let interrupt = ctx.step("flaky", vec![]).unwrap_err();
        assert_eq!(interrupt.as_failure().unwrap().message, "gave up");
    }

    #[test]
    fn test_unexpected_event_is_log_corruption() {
        let run = test_run();
        // Seed a step_completed as the next event while the body reaches a
        // sleep first.
        let events = vec![event(
            &run,
            1,
            &CorrelationId::from("step_other"),
            EventPayload::StepCompleted { output: json!(1) },
        )];

        let mut ctx = WorkflowContext::new(&run, events, None);
        let interrupt = ctx.sleep(Duration::from_secs(1)).unwrap_err();
        match interrupt {
            Interrupt::Runtime(error) => {
                assert!(error.has_code(codes::WORKFLOW_RUNTIME_ERROR));
                assert!(error.message.contains("step_completed"));
                assert!(error.message.contains("wait_"));
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn test_step_name_divergence_detected() {
        let run = test_run();
        let ulids = correlations(&run, 1);
        let correlation = CorrelationId::step(ulids[0]);

        let events = vec![event(
            &run,
            1,
            &correlation,
            EventPayload::StepStarted {
                step_name: "recorded_name".into(),
                input: vec![],
                attempt: 1,
            },
        )];

        let mut ctx = WorkflowContext::new(&run, events, None);
        let interrupt = ctx.step("different_name", vec![]).unwrap_err();
        assert!(matches!(interrupt, Interrupt::Runtime(_)));
    }

    #[test]
    fn test_sleep_acknowledges_then_suspends() {
        let run = test_run();
        let ulids = correlations(&run, 1);
        let correlation = CorrelationId::wait(ulids[0]);

        let events = vec![event(
            &run,
            1,
            &correlation,
            EventPayload::WaitCreated {
                resume_at: Utc::now(),
            },
        )];

        let mut ctx = WorkflowContext::new(&run, events, None);
        let result = ctx.sleep(Duration::from_secs(1));
        assert!(matches!(result, Err(Interrupt::Suspended)));

        // Entry is acknowledged, carrying the server-assigned deadline.
        let entry = ctx.invocations().entries().next().unwrap();
        assert!(entry.acknowledged);
    }

    #[test]
    fn test_hook_first_reach_suspends_then_resolves() {
        let run = test_run();
        let ulids = correlations(&run, 1);
        let correlation = CorrelationId::hook(ulids[0]);

        let mut ctx = WorkflowContext::new(&run, vec![], None);
        assert!(matches!(
            ctx.create_hook(HookOptions::default()),
            Err(Interrupt::Suspended)
        ));

        let events = vec![
            event(
                &run,
                1,
                &correlation,
                EventPayload::HookCreated {
                    token: "tok".into(),
                    metadata: None,
                    policy: HookPolicy::Single,
                },
            ),
            event(
                &run,
                2,
                &correlation,
                EventPayload::HookReceived {
                    payload: json!({"x": 1}),
                },
            ),
        ];

        let mut ctx = WorkflowContext::new(&run, events, None);
        let hook = ctx.create_hook(HookOptions::default()).unwrap();
        assert_eq!(hook.token, "tok");

        let payload = ctx.recv_hook(&hook).unwrap();
        assert_eq!(payload, json!({"x": 1}));

        // No second delivery yet.
        assert!(matches!(ctx.recv_hook(&hook), Err(Interrupt::Suspended)));
    }

    #[test]
    fn test_parallel_spawn_order_is_stable() {
        let run = test_run();

        // First replay: spawn two steps, record their correlation IDs.
        let mut ctx = WorkflowContext::new(&run, vec![], None);
        let a = ctx.spawn_step("a", vec![]).unwrap();
        let b = ctx.spawn_step("b", vec![]).unwrap();
        assert!(a.correlation_id < b.correlation_id);

        // Fresh context replays to identical IDs.
        let mut replay = WorkflowContext::new(&run, vec![], None);
        let a2 = replay.spawn_step("a", vec![]).unwrap();
        let b2 = replay.spawn_step("b", vec![]).unwrap();
        assert_eq!(a.correlation_id, a2.correlation_id);
        assert_eq!(b.correlation_id, b2.correlation_id);
    }

    #[test]
    fn test_writable_name_is_deterministic() {
        let run = test_run();
        let mut ctx = WorkflowContext::new(&run, vec![], None);
        let mut replay = WorkflowContext::new(&run, vec![], None);

        assert_eq!(
            ctx.get_writable(Some("stdout")).stream_name,
            replay.get_writable(Some("stdout")).stream_name
        );
        assert!(ctx.get_writable(Some("x")).stream_name.ends_with(":x"));
    }

    #[test]
    fn test_frozen_clock_and_seeded_rng() {
        let run = test_run();
        let mut ctx = WorkflowContext::new(&run, vec![], None);
        let mut replay = WorkflowContext::new(&run, vec![], None);

        assert_eq!(ctx.now(), run.started_at);
        assert_eq!(ctx.random(), replay.random());
    }
}
