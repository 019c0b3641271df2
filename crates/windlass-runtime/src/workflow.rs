//! Workflow trait and registry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use windlass_core::{codes, ErrorInfo};

use crate::context::{Interrupt, WorkflowContext};

/// A durable workflow definition.
///
/// The body re-executes deterministically on every tick: all effects go
/// through the context's primitives, which resolve from the event log.
/// Ambient time, randomness, and IDs must come from the context, never from
/// the environment.
///
/// # Example
///
/// ```ignore
/// struct OrderTotal;
///
/// impl Workflow for OrderTotal {
///     const NAME: &'static str = "order_total";
///     type Input = (i64, i64);
///     type Output = i64;
///
///     fn run(&self, ctx: &mut WorkflowContext, (a, b): Self::Input)
///         -> Result<Self::Output, Interrupt>
///     {
///         let first = ctx.step("add", vec![json!(a), json!(b)])?;
///         Ok(first.as_i64().unwrap_or_default())
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique name, recorded on `run_created` and used for registry lookup.
    const NAME: &'static str;

    /// Deserialized from the run's input sequence: the whole argument array
    /// first, a single bare argument next, and `null` for an empty input.
    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    fn run(&self, ctx: &mut WorkflowContext, input: Self::Input)
        -> Result<Self::Output, Interrupt>;
}

/// Type-erased workflow interface the tick driver calls.
pub trait AnyWorkflow: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut WorkflowContext, input: &[Value]) -> Result<Value, Interrupt>;
}

struct WorkflowWrapper<W: Workflow + Default> {
    inner: W,
}

impl<W: Workflow + Default> AnyWorkflow for WorkflowWrapper<W> {
    fn name(&self) -> &'static str {
        W::NAME
    }

    fn run(&self, ctx: &mut WorkflowContext, input: &[Value]) -> Result<Value, Interrupt> {
        let typed: W::Input = deserialize_args(input).map_err(|error| {
            Interrupt::Failed(
                ErrorInfo::new(format!("workflow input rejected: {error}"))
                    .with_code("INVALID_INPUT"),
            )
        })?;

        let output = self.inner.run(ctx, typed)?;

        serde_json::to_value(output).map_err(|error| {
            Interrupt::Failed(ErrorInfo::new(format!(
                "workflow output not serializable: {error}"
            )))
        })
    }
}

/// Deserialize an argument sequence into a typed input: the full array
/// first, then a single bare argument, then `null` when empty.
pub(crate) fn deserialize_args<T: DeserializeOwned>(input: &[Value]) -> Result<T, serde_json::Error> {
    match serde_json::from_value(Value::Array(input.to_vec())) {
        Ok(typed) => Ok(typed),
        Err(error) => {
            if input.len() == 1 {
                if let Ok(typed) = serde_json::from_value(input[0].clone()) {
                    return Ok(typed);
                }
            }
            if input.is_empty() {
                if let Ok(typed) = serde_json::from_value(Value::Null) {
                    return Ok(typed);
                }
            }
            Err(error)
        }
    }
}

/// Registry of workflow definitions keyed by name.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn AnyWorkflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow + Default>(&mut self) {
        self.workflows
            .insert(W::NAME.to_string(), Arc::new(WorkflowWrapper { inner: W::default() }));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnyWorkflow>> {
        self.workflows.get(name).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    /// The failure recorded when a run names an unregistered workflow.
    pub fn unknown_workflow_error(name: &str) -> ErrorInfo {
        ErrorInfo::new(format!("workflow not registered: {name}"))
            .with_code(codes::WORKFLOW_NOT_REGISTERED)
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Doubler;

    impl Workflow for Doubler {
        const NAME: &'static str = "doubler";
        type Input = i64;
        type Output = i64;

        fn run(&self, _ctx: &mut WorkflowContext, input: i64) -> Result<i64, Interrupt> {
            Ok(input * 2)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<Doubler>();

        assert!(registry.contains("doubler"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["doubler"]);
    }

    #[test]
    fn test_deserialize_args_cascade() {
        // Tuple from the full array.
        let pair: (i64, i64) = deserialize_args(&[json!(2), json!(3)]).unwrap();
        assert_eq!(pair, (2, 3));

        // Single bare argument.
        let single: i64 = deserialize_args(&[json!(7)]).unwrap();
        assert_eq!(single, 7);

        // Empty input into unit.
        let unit: () = deserialize_args(&[]).unwrap();
        let _ = unit;

        // Vec<Value> passthrough.
        let raw: Vec<Value> = deserialize_args(&[json!(1), json!("x")]).unwrap();
        assert_eq!(raw, vec![json!(1), json!("x")]);
    }

    #[test]
    fn test_invalid_input_is_failure() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<Doubler>();

        let run = windlass_core::Run {
            run_id: windlass_core::RunId::generate(),
            workflow_name: "doubler".into(),
            status: windlass_core::RunStatus::Running,
            input: vec![],
            output: None,
            error: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
            expires_at: None,
            trace_carrier: windlass_core::TraceCarrier::new(),
        };
        let mut ctx = WorkflowContext::new(&run, vec![], None);

        let workflow = registry.get("doubler").unwrap();
        let result = workflow.run(&mut ctx, &[json!("not a number")]);
        match result {
            Err(Interrupt::Failed(error)) => assert!(error.message.contains("input rejected")),
            other => panic!("expected input failure, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_workflow_error_code() {
        let error = WorkflowRegistry::unknown_workflow_error("ghost");
        assert!(error.has_code(codes::WORKFLOW_NOT_REGISTERED));
    }
}
