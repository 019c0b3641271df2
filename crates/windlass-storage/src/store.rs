//! Storage trait definition
//!
//! Storage owns the event log. Runs, steps, and hooks are materialized
//! views callers receive as immutable snapshots; every mutation in the
//! system goes through [`Storage::events_create`].

use async_trait::async_trait;

use windlass_core::{
    CorrelationId, Event, Hook, HookId, NewEvent, Run, RunId, RunStatus, Step, StepId,
};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(StepId),

    /// Hook not found
    #[error("hook not found: {0}")]
    HookNotFound(String),

    /// Conditional-append uniqueness rejection: a terminal event already
    /// exists for this `(run, correlation)`. Callers treat this as
    /// "somebody else already did it".
    #[error("terminal event already recorded for {correlation_id} in run {run_id}")]
    Conflict {
        run_id: RunId,
        correlation_id: CorrelationId,
    },

    /// The event is not valid in this position (e.g. a second `run_created`
    /// for an existing run).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The caller lacks credentials for the backing store. Surfaced to the
    /// caller; never a run-level failure.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Backend error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether this error is the benign lost-the-append-race case.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Listing order over monotonic IDs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One page of a cursor-based listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,

    /// Opaque cursor to resume after the last item, when more remain.
    pub cursor: Option<String>,

    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: vec![],
            cursor: None,
            has_more: false,
        }
    }
}

const DEFAULT_PAGE_LIMIT: usize = 100;

/// Parameters for [`Storage::runs_list`].
#[derive(Debug, Clone, Default)]
pub struct ListRunsParams {
    pub status: Option<RunStatus>,

    /// Keep only runs whose workflow name starts with this prefix.
    pub name_prefix: Option<String>,

    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

/// Parameters for [`Storage::steps_list`].
#[derive(Debug, Clone)]
pub struct ListStepsParams {
    pub run_id: RunId,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl ListStepsParams {
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id,
            cursor: None,
            limit: None,
            order: SortOrder::Asc,
        }
    }
}

/// Parameters for [`Storage::events_list`].
#[derive(Debug, Clone)]
pub struct ListEventsParams {
    pub run_id: RunId,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl ListEventsParams {
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id,
            cursor: None,
            limit: None,
            order: SortOrder::Asc,
        }
    }
}

/// Parameters for [`Storage::events_list_by_correlation_id`].
#[derive(Debug, Clone)]
pub struct ListByCorrelationParams {
    pub run_id: RunId,
    pub correlation_id: CorrelationId,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

/// Parameters for [`Storage::hooks_list`].
#[derive(Debug, Clone, Default)]
pub struct ListHooksParams {
    /// Restrict to one run; `None` lists across runs.
    pub run_id: Option<RunId>,

    pub include_disposed: bool,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

pub(crate) fn effective_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1)
}

/// The entity a new event affected, returned alongside the event itself.
#[derive(Debug, Clone)]
pub enum Entity {
    Run(Run),
    Step(Step),
    Hook(Hook),
}

impl Entity {
    pub fn as_run(&self) -> Option<&Run> {
        match self {
            Self::Run(run) => Some(run),
            _ => None,
        }
    }

    pub fn as_step(&self) -> Option<&Step> {
        match self {
            Self::Step(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_hook(&self) -> Option<&Hook> {
        match self {
            Self::Hook(hook) => Some(hook),
            _ => None,
        }
    }
}

/// Result of a successful conditional append.
#[derive(Debug, Clone)]
pub struct Appended {
    pub event: Event,
    pub entity: Entity,
}

/// The storage contract the runtime consumes.
///
/// Implementations must be thread-safe; `events_create` must be atomic per
/// `(run, event)` and enforce terminal-event uniqueness per
/// `(run, correlation)`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // =========================================================================
    // Runs
    // =========================================================================

    async fn run_get(&self, run_id: &RunId) -> Result<Run, StorageError>;

    async fn runs_list(&self, params: ListRunsParams) -> Result<Page<Run>, StorageError>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn step_get(&self, run_id: &RunId, step_id: &StepId) -> Result<Step, StorageError>;

    async fn steps_list(&self, params: ListStepsParams) -> Result<Page<Step>, StorageError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Append one event atomically, projecting it into the affected entity.
    ///
    /// With `run_id = None` the event must be `run_created`; the store
    /// generates the new run's ID and correlates the event on it. Appending
    /// a second terminal event for the same `(run, correlation)` fails with
    /// [`StorageError::Conflict`]. Appending a run-terminal event disposes
    /// every outstanding hook on the run.
    async fn events_create(
        &self,
        run_id: Option<&RunId>,
        event: NewEvent,
    ) -> Result<Appended, StorageError>;

    async fn events_list(&self, params: ListEventsParams) -> Result<Page<Event>, StorageError>;

    async fn events_list_by_correlation_id(
        &self,
        params: ListByCorrelationParams,
    ) -> Result<Page<Event>, StorageError>;

    // =========================================================================
    // Hooks
    // =========================================================================

    async fn hook_get(&self, hook_id: &HookId) -> Result<Hook, StorageError>;

    async fn hook_get_by_token(&self, token: &str) -> Result<Hook, StorageError>;

    async fn hooks_list(&self, params: ListHooksParams) -> Result<Page<Hook>, StorageError>;
}
