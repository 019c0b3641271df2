//! In-memory implementation of the Storage trait
//!
//! Reference backend with the exact semantics production backends must
//! provide: atomic conditional append, event-sourced projections, implicit
//! hook disposal on run termination. Primarily for tests and embedding.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use windlass_core::{
    CorrelationId, Event, EventId, EventPayload, Hook, HookId, NewEvent, Run, RunId, Step, StepId,
    UlidFactory,
};

use crate::store::*;

/// Per-run state: the log plus its materialized views.
struct RunRecord {
    run: Run,
    events: Vec<Event>,
    steps: HashMap<StepId, Step>,
    step_order: Vec<StepId>,
    hooks: HashMap<HookId, Hook>,
    hook_order: Vec<HookId>,
}

#[derive(Default)]
struct StorageState {
    /// BTreeMap keyed by ULID run ID: iteration order is creation order.
    runs: BTreeMap<RunId, RunRecord>,
    tokens: HashMap<String, (RunId, HookId)>,
}

/// In-memory [`Storage`] implementation.
///
/// # Example
///
/// ```
/// use windlass_storage::InMemoryStorage;
///
/// let storage = InMemoryStorage::new();
/// ```
pub struct InMemoryStorage {
    state: RwLock<StorageState>,
    ids: parking_lot::Mutex<UlidFactory>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StorageState::default()),
            ids: parking_lot::Mutex::new(UlidFactory::system()),
        }
    }

    pub fn run_count(&self) -> usize {
        self.state.read().runs.len()
    }

    fn next_event_id(&self) -> EventId {
        EventId::from(self.ids.lock().next().to_string())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn project(record: &mut RunRecord, tokens: &mut HashMap<String, (RunId, HookId)>, event: &Event) {
    record.run.apply(event);

    match &event.payload {
        EventPayload::StepStarted { attempt, .. } => {
            let step_id = event.correlation_id.as_step_id();
            match record.steps.get_mut(&step_id) {
                Some(step) => step.apply(event),
                None if *attempt == 1 => {
                    if let Some(step) = Step::from_started(event) {
                        record.steps.insert(step_id.clone(), step);
                        record.step_order.push(step_id);
                    }
                }
                // Later attempts without a projected first attempt: the log
                // is authoritative, the view just has nothing to fold into.
                None => {}
            }
        }
        EventPayload::StepRetrying { .. }
        | EventPayload::StepCompleted { .. }
        | EventPayload::StepFailed { .. } => {
            let step_id = event.correlation_id.as_step_id();
            if let Some(step) = record.steps.get_mut(&step_id) {
                step.apply(event);
            }
        }
        EventPayload::HookCreated { token, .. } => {
            if let Some(hook) = Hook::from_created(event) {
                let hook_id = hook.hook_id.clone();
                tokens.insert(token.clone(), (event.run_id.clone(), hook_id.clone()));
                record.hooks.insert(hook_id.clone(), hook);
                record.hook_order.push(hook_id);
            }
        }
        EventPayload::HookDisposed => {
            let hook_id = event.correlation_id.as_hook_id();
            if let Some(hook) = record.hooks.get_mut(&hook_id) {
                hook.apply(event);
            }
        }
        EventPayload::RunCancelled { .. } => {
            for step in record.steps.values_mut() {
                step.apply(event);
            }
        }
        _ => {}
    }
}

fn paginate<T: Clone>(
    items: Vec<T>,
    cursor: Option<&str>,
    limit: Option<usize>,
    order: SortOrder,
    key: impl Fn(&T) -> &str,
) -> Page<T> {
    let limit = effective_limit(limit);

    let mut ordered = items;
    if order == SortOrder::Desc {
        ordered.reverse();
    }

    let filtered: Vec<T> = ordered
        .into_iter()
        .filter(|item| match cursor {
            Some(cursor) => match order {
                SortOrder::Asc => key(item) > cursor,
                SortOrder::Desc => key(item) < cursor,
            },
            None => true,
        })
        .collect();

    let has_more = filtered.len() > limit;
    let items: Vec<T> = filtered.into_iter().take(limit).collect();
    let cursor = if has_more {
        items.last().map(|item| key(item).to_string())
    } else {
        None
    };

    Page {
        items,
        cursor,
        has_more,
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn run_get(&self, run_id: &RunId) -> Result<Run, StorageError> {
        let state = self.state.read();
        state
            .runs
            .get(run_id)
            .map(|record| record.run.clone())
            .ok_or_else(|| StorageError::RunNotFound(run_id.clone()))
    }

    async fn runs_list(&self, params: ListRunsParams) -> Result<Page<Run>, StorageError> {
        let state = self.state.read();
        let runs: Vec<Run> = state
            .runs
            .values()
            .map(|record| &record.run)
            .filter(|run| params.status.is_none_or(|status| run.status == status))
            .filter(|run| {
                params
                    .name_prefix
                    .as_deref()
                    .is_none_or(|prefix| run.workflow_name.starts_with(prefix))
            })
            .cloned()
            .collect();

        Ok(paginate(
            runs,
            params.cursor.as_deref(),
            params.limit,
            params.order,
            |run| run.run_id.as_str(),
        ))
    }

    async fn step_get(&self, run_id: &RunId, step_id: &StepId) -> Result<Step, StorageError> {
        let state = self.state.read();
        let record = state
            .runs
            .get(run_id)
            .ok_or_else(|| StorageError::RunNotFound(run_id.clone()))?;
        record
            .steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| StorageError::StepNotFound(step_id.clone()))
    }

    async fn steps_list(&self, params: ListStepsParams) -> Result<Page<Step>, StorageError> {
        let state = self.state.read();
        let record = state
            .runs
            .get(&params.run_id)
            .ok_or_else(|| StorageError::RunNotFound(params.run_id.clone()))?;

        let steps: Vec<Step> = record
            .step_order
            .iter()
            .filter_map(|id| record.steps.get(id))
            .cloned()
            .collect();

        Ok(paginate(
            steps,
            params.cursor.as_deref(),
            params.limit,
            params.order,
            |step| step.step_id.as_str(),
        ))
    }

    async fn events_create(
        &self,
        run_id: Option<&RunId>,
        new_event: NewEvent,
    ) -> Result<Appended, StorageError> {
        let mut state = self.state.write();
        let created_at = Utc::now();

        let run_id = match run_id {
            Some(id) => id.clone(),
            None => {
                if !matches!(new_event.payload, EventPayload::RunCreated { .. }) {
                    return Err(StorageError::InvalidEvent(
                        "only run_created may omit the run id".to_string(),
                    ));
                }
                RunId::generate()
            }
        };

        // Run-lifecycle events always correlate on the run itself.
        let correlation_id = if new_event.payload.is_run_terminal()
            || matches!(new_event.payload, EventPayload::RunCreated { .. })
        {
            CorrelationId::run(&run_id)
        } else {
            new_event.correlation_id.clone()
        };

        if let EventPayload::RunCreated { .. } = &new_event.payload {
            if state.runs.contains_key(&run_id) {
                return Err(StorageError::InvalidEvent(format!(
                    "run already exists: {run_id}"
                )));
            }

            let event = Event {
                event_id: self.next_event_id(),
                run_id: run_id.clone(),
                correlation_id,
                payload: new_event.payload,
                created_at,
            };

            let run = Run::from_created(&event).ok_or_else(|| {
                StorageError::InvalidEvent("run_created projection failed".to_string())
            })?;

            state.runs.insert(
                run_id.clone(),
                RunRecord {
                    run: run.clone(),
                    events: vec![event.clone()],
                    steps: HashMap::new(),
                    step_order: vec![],
                    hooks: HashMap::new(),
                    hook_order: vec![],
                },
            );

            return Ok(Appended {
                event,
                entity: Entity::Run(run),
            });
        }

        let StorageState { runs, tokens } = &mut *state;
        let record = runs
            .get_mut(&run_id)
            .ok_or_else(|| StorageError::RunNotFound(run_id.clone()))?;

        // Conditional uniqueness: one terminal event per (run, correlation).
        if new_event.payload.is_terminal()
            && record
                .events
                .iter()
                .any(|e| e.correlation_id == correlation_id && e.is_terminal())
        {
            return Err(StorageError::Conflict {
                run_id,
                correlation_id,
            });
        }

        // A run reaching a terminal state implicitly disposes its hooks; the
        // disposals land in the same atomic append, ahead of the terminal
        // event itself.
        if new_event.payload.is_run_terminal() {
            let outstanding: Vec<HookId> = record
                .hook_order
                .iter()
                .filter(|id| record.hooks.get(*id).is_some_and(|h| !h.is_disposed()))
                .cloned()
                .collect();

            for hook_id in outstanding {
                let disposal = Event {
                    event_id: self.next_event_id(),
                    run_id: run_id.clone(),
                    correlation_id: hook_id.correlation(),
                    payload: EventPayload::HookDisposed,
                    created_at,
                };
                record.events.push(disposal.clone());
                project(record, tokens, &disposal);
            }
        }

        let event = Event {
            event_id: self.next_event_id(),
            run_id: run_id.clone(),
            correlation_id: correlation_id.clone(),
            payload: new_event.payload,
            created_at,
        };

        record.events.push(event.clone());
        project(record, tokens, &event);

        let entity = match &event.payload {
            EventPayload::StepStarted { .. }
            | EventPayload::StepRetrying { .. }
            | EventPayload::StepCompleted { .. }
            | EventPayload::StepFailed { .. } => record
                .steps
                .get(&correlation_id.as_step_id())
                .cloned()
                .map(Entity::Step)
                .unwrap_or_else(|| Entity::Run(record.run.clone())),
            EventPayload::HookCreated { .. }
            | EventPayload::HookReceived { .. }
            | EventPayload::HookDisposed => record
                .hooks
                .get(&correlation_id.as_hook_id())
                .cloned()
                .map(Entity::Hook)
                .unwrap_or_else(|| Entity::Run(record.run.clone())),
            _ => Entity::Run(record.run.clone()),
        };

        Ok(Appended { event, entity })
    }

    async fn events_list(&self, params: ListEventsParams) -> Result<Page<Event>, StorageError> {
        let state = self.state.read();
        let record = state
            .runs
            .get(&params.run_id)
            .ok_or_else(|| StorageError::RunNotFound(params.run_id.clone()))?;

        Ok(paginate(
            record.events.clone(),
            params.cursor.as_deref(),
            params.limit,
            params.order,
            |event| event.event_id.as_str(),
        ))
    }

    async fn events_list_by_correlation_id(
        &self,
        params: ListByCorrelationParams,
    ) -> Result<Page<Event>, StorageError> {
        let state = self.state.read();
        let record = state
            .runs
            .get(&params.run_id)
            .ok_or_else(|| StorageError::RunNotFound(params.run_id.clone()))?;

        let events: Vec<Event> = record
            .events
            .iter()
            .filter(|event| event.correlation_id == params.correlation_id)
            .cloned()
            .collect();

        Ok(paginate(
            events,
            params.cursor.as_deref(),
            params.limit,
            params.order,
            |event| event.event_id.as_str(),
        ))
    }

    async fn hook_get(&self, hook_id: &HookId) -> Result<Hook, StorageError> {
        let state = self.state.read();
        state
            .runs
            .values()
            .find_map(|record| record.hooks.get(hook_id))
            .cloned()
            .ok_or_else(|| StorageError::HookNotFound(hook_id.to_string()))
    }

    async fn hook_get_by_token(&self, token: &str) -> Result<Hook, StorageError> {
        let state = self.state.read();
        let (run_id, hook_id) = state
            .tokens
            .get(token)
            .ok_or_else(|| StorageError::HookNotFound(format!("token {token}")))?;
        state
            .runs
            .get(run_id)
            .and_then(|record| record.hooks.get(hook_id))
            .cloned()
            .ok_or_else(|| StorageError::HookNotFound(hook_id.to_string()))
    }

    async fn hooks_list(&self, params: ListHooksParams) -> Result<Page<Hook>, StorageError> {
        let state = self.state.read();

        let mut hooks: Vec<Hook> = vec![];
        for (run_id, record) in &state.runs {
            if params.run_id.as_ref().is_some_and(|id| id != run_id) {
                continue;
            }
            hooks.extend(
                record
                    .hook_order
                    .iter()
                    .filter_map(|id| record.hooks.get(id))
                    .filter(|hook| params.include_disposed || !hook.is_disposed())
                    .cloned(),
            );
        }

        Ok(paginate(
            hooks,
            params.cursor.as_deref(),
            params.limit,
            params.order,
            |hook| hook.hook_id.as_str(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_core::{HookPolicy, RunStatus, StepStatus, TraceCarrier};

    fn run_created(name: &str) -> NewEvent {
        NewEvent::new(
            CorrelationId::from("placeholder"),
            EventPayload::RunCreated {
                workflow_name: name.to_string(),
                input: vec![json!(1)],
                trace_carrier: TraceCarrier::new(),
                expires_at: None,
            },
        )
    }

    async fn start_run(storage: &InMemoryStorage, name: &str) -> RunId {
        let appended = storage.events_create(None, run_created(name)).await.unwrap();
        appended.event.run_id.clone()
    }

    #[tokio::test]
    async fn test_server_generates_run_id() {
        let storage = InMemoryStorage::new();
        let appended = storage
            .events_create(None, run_created("order"))
            .await
            .unwrap();

        // Event correlates on the newly minted run.
        assert_eq!(
            appended.event.correlation_id.as_str(),
            appended.event.run_id.as_str()
        );

        let run = appended.entity.as_run().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(storage.run_count(), 1);
    }

    #[tokio::test]
    async fn test_non_created_event_requires_run_id() {
        let storage = InMemoryStorage::new();
        let result = storage
            .events_create(
                None,
                NewEvent::new(
                    CorrelationId::from("wait_x"),
                    EventPayload::WaitCompleted,
                ),
            )
            .await;
        assert!(matches!(result, Err(StorageError::InvalidEvent(_))));
    }

    #[tokio::test]
    async fn test_terminal_uniqueness_conflict() {
        let storage = InMemoryStorage::new();
        let run_id = start_run(&storage, "order").await;

        let completed = NewEvent::new(
            CorrelationId::run(&run_id),
            EventPayload::RunCompleted { output: json!(1) },
        );
        storage
            .events_create(Some(&run_id), completed.clone())
            .await
            .unwrap();

        let second = storage.events_create(Some(&run_id), completed).await;
        let error = second.expect_err("duplicate terminal must be rejected");
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn test_step_projection_through_events() {
        let storage = InMemoryStorage::new();
        let run_id = start_run(&storage, "order").await;
        let correlation = CorrelationId::from("step_01TEST");

        storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    correlation.clone(),
                    EventPayload::StepStarted {
                        step_name: "charge".into(),
                        input: vec![json!(5)],
                        attempt: 1,
                    },
                ),
            )
            .await
            .unwrap();

        // First step flips the run to running.
        let run = storage.run_get(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let appended = storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    correlation.clone(),
                    EventPayload::StepCompleted { output: json!(10) },
                ),
            )
            .await
            .unwrap();

        let step = appended.entity.as_step().unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.output, Some(json!(10)));

        let listed = storage
            .steps_list(ListStepsParams::for_run(run_id))
            .await
            .unwrap();
        assert_eq!(listed.items.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_step_completion_rejected() {
        let storage = InMemoryStorage::new();
        let run_id = start_run(&storage, "order").await;
        let correlation = CorrelationId::from("step_01TEST");

        storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    correlation.clone(),
                    EventPayload::StepStarted {
                        step_name: "charge".into(),
                        input: vec![],
                        attempt: 1,
                    },
                ),
            )
            .await
            .unwrap();
        storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    correlation.clone(),
                    EventPayload::StepCompleted { output: json!(1) },
                ),
            )
            .await
            .unwrap();

        let duplicate = storage
            .events_create(
                Some(&run_id),
                NewEvent::new(correlation, EventPayload::StepCompleted { output: json!(2) }),
            )
            .await;
        assert!(matches!(duplicate, Err(StorageError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_run_termination_disposes_hooks() {
        let storage = InMemoryStorage::new();
        let run_id = start_run(&storage, "order").await;

        storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    CorrelationId::from("hook_01TEST"),
                    EventPayload::HookCreated {
                        token: "secret".into(),
                        metadata: None,
                        policy: HookPolicy::Single,
                    },
                ),
            )
            .await
            .unwrap();

        let hook = storage.hook_get_by_token("secret").await.unwrap();
        assert!(!hook.is_disposed());

        storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    CorrelationId::run(&run_id),
                    EventPayload::RunCompleted { output: json!(null) },
                ),
            )
            .await
            .unwrap();

        let hook = storage.hook_get_by_token("secret").await.unwrap();
        assert!(hook.is_disposed());

        // The disposal is in the log, after the terminal event.
        let events = storage
            .events_list(ListEventsParams::for_run(run_id))
            .await
            .unwrap();
        let types: Vec<&str> = events.items.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["run_created", "hook_created", "hook_disposed", "run_completed"]
        );
    }

    #[tokio::test]
    async fn test_event_ids_strictly_monotonic() {
        let storage = InMemoryStorage::new();
        let run_id = start_run(&storage, "order").await;

        for i in 0..10 {
            storage
                .events_create(
                    Some(&run_id),
                    NewEvent::new(
                        CorrelationId::from(format!("step_{i:026}")),
                        EventPayload::StepStarted {
                            step_name: "noop".into(),
                            input: vec![],
                            attempt: 1,
                        },
                    ),
                )
                .await
                .unwrap();
        }

        let events = storage
            .events_list(ListEventsParams::for_run(run_id))
            .await
            .unwrap();
        for pair in events.items.windows(2) {
            assert!(pair[0].event_id < pair[1].event_id);
        }
    }

    #[tokio::test]
    async fn test_pagination_cursor() {
        let storage = InMemoryStorage::new();
        for i in 0..5 {
            start_run(&storage, &format!("wf_{i}")).await;
        }

        let first = storage
            .runs_list(ListRunsParams {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);

        let second = storage
            .runs_list(ListRunsParams {
                limit: Some(10),
                cursor: first.cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(!second.has_more);
        assert!(second.items[0].run_id > first.items[1].run_id);
    }

    #[tokio::test]
    async fn test_runs_list_filters() {
        let storage = InMemoryStorage::new();
        start_run(&storage, "billing_charge").await;
        start_run(&storage, "billing_refund").await;
        start_run(&storage, "shipping_label").await;

        let billing = storage
            .runs_list(ListRunsParams {
                name_prefix: Some("billing_".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(billing.items.len(), 2);

        let completed = storage
            .runs_list(ListRunsParams {
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(completed.items.is_empty());
    }

    #[tokio::test]
    async fn test_events_list_by_correlation() {
        let storage = InMemoryStorage::new();
        let run_id = start_run(&storage, "order").await;
        let correlation = CorrelationId::from("hook_01TEST");

        storage
            .events_create(
                Some(&run_id),
                NewEvent::new(
                    correlation.clone(),
                    EventPayload::HookCreated {
                        token: "t".into(),
                        metadata: None,
                        policy: HookPolicy::Stream,
                    },
                ),
            )
            .await
            .unwrap();
        for i in 0..3 {
            storage
                .events_create(
                    Some(&run_id),
                    NewEvent::new(
                        correlation.clone(),
                        EventPayload::HookReceived {
                            payload: json!({ "n": i }),
                        },
                    ),
                )
                .await
                .unwrap();
        }

        let events = storage
            .events_list_by_correlation_id(ListByCorrelationParams {
                run_id,
                correlation_id: correlation,
                cursor: None,
                limit: None,
                order: SortOrder::Asc,
            })
            .await
            .unwrap();
        assert_eq!(events.items.len(), 4);
        // Deliveries preserved in arrival order.
        assert_eq!(
            events.items[1..]
                .iter()
                .map(|e| e.event_type())
                .collect::<Vec<_>>(),
            vec!["hook_received"; 3]
        );
    }
}
