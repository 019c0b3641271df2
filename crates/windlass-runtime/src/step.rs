//! Step definitions and execution context
//!
//! Steps are the side-effecting units of work inside a workflow. Unlike
//! workflow bodies they run in a plain execution context: a step may read
//! the clock, network, disk, and RNG freely. Failures are either retryable
//! (consumed by the retry scheduler) or fatal (surfaced to the workflow as
//! a rejected primitive call).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use windlass_core::{ErrorInfo, RetryPolicy, RunId, StepId, StreamRef};
use windlass_storage::{StreamError, Streamer};

use crate::streams::{StreamerConfig, WritableStream};
use crate::workflow::deserialize_args;

/// Error type for step failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub message: String,

    /// Error code for programmatic handling and retry filtering.
    pub code: Option<String>,

    /// Retryable failures go through the backoff schedule; fatal ones fail
    /// the step immediately.
    pub retryable: bool,
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<StepError> for ErrorInfo {
    fn from(err: StepError) -> Self {
        let mut info = ErrorInfo::new(err.message);
        if let Some(code) = err.code {
            info = info.with_code(code);
        }
        info
    }
}

/// A durable step definition.
///
/// # Example
///
/// ```ignore
/// #[derive(Default)]
/// struct SendEmail;
///
/// #[async_trait]
/// impl Step for SendEmail {
///     const NAME: &'static str = "send_email";
///     type Input = EmailRequest;
///     type Output = EmailReceipt;
///
///     async fn execute(
///         &self,
///         ctx: &StepContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, StepError> {
///         // Side effects are fine here.
///         Ok(send(input).await?)
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Unique name, recorded on `step_started` and used for registry lookup.
    const NAME: &'static str;

    /// Deserialized with the same cascade as workflow inputs.
    type Input: DeserializeOwned + Send;

    type Output: Serialize + Send;

    /// Retry schedule for this step.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn execute(&self, ctx: &StepContext, input: Self::Input)
        -> Result<Self::Output, StepError>;
}

/// Context provided to step bodies during execution.
pub struct StepContext {
    pub run_id: RunId,
    pub step_id: StepId,

    /// Current attempt (1-based).
    pub attempt: u32,

    pub max_attempts: u32,

    streamer: Arc<dyn Streamer>,
    stream_config: StreamerConfig,
    open_streams: parking_lot::Mutex<Vec<WritableStream>>,
}

impl StepContext {
    pub(crate) fn new(
        run_id: RunId,
        step_id: StepId,
        attempt: u32,
        max_attempts: u32,
        streamer: Arc<dyn Streamer>,
        stream_config: StreamerConfig,
    ) -> Self {
        Self {
            run_id,
            step_id,
            attempt,
            max_attempts,
            streamer,
            stream_config,
            open_streams: parking_lot::Mutex::new(vec![]),
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Attach to a stream handle the workflow derived via `get_writable`.
    pub fn writable(&self, stream_ref: &StreamRef) -> WritableStream {
        self.track(WritableStream::new(
            self.run_id.clone(),
            stream_ref.stream_name.clone(),
            Arc::clone(&self.streamer),
            &self.stream_config,
        ))
    }

    /// Create a stream owned by this step, named after its correlation ID.
    pub fn create_stream(&self, namespace: Option<&str>) -> WritableStream {
        let name = match namespace {
            Some(ns) => format!("{}:{ns}", self.step_id),
            None => self.step_id.to_string(),
        };
        self.track(WritableStream::new(
            self.run_id.clone(),
            name,
            Arc::clone(&self.streamer),
            &self.stream_config,
        ))
    }

    fn track(&self, stream: WritableStream) -> WritableStream {
        self.open_streams.lock().push(stream.clone());
        stream
    }

    /// Close every stream this step opened; runs before `step_completed`
    /// is appended so closes are observable first.
    pub(crate) async fn seal_streams(&self) -> Result<(), StreamError> {
        let streams: Vec<WritableStream> = self.open_streams.lock().drain(..).collect();
        for stream in streams {
            stream.seal().await?;
        }
        Ok(())
    }
}

/// Type-erased step interface the step runtime calls.
#[async_trait]
pub trait AnyStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn retry_policy(&self) -> RetryPolicy;

    async fn execute(&self, ctx: &StepContext, input: Vec<Value>) -> Result<Value, StepError>;
}

struct StepWrapper<S: Step + Default> {
    inner: S,
}

#[async_trait]
impl<S: Step + Default> AnyStep for StepWrapper<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    async fn execute(&self, ctx: &StepContext, input: Vec<Value>) -> Result<Value, StepError> {
        let typed: S::Input = deserialize_args(&input)
            .map_err(|error| StepError::fatal(format!("step input rejected: {error}")))?;

        let output = self.inner.execute(ctx, typed).await?;

        serde_json::to_value(output)
            .map_err(|error| StepError::fatal(format!("step output not serializable: {error}")))
    }
}

/// Registry of step definitions keyed by name.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn AnyStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Step + Default>(&mut self) {
        self.steps
            .insert(S::NAME.to_string(), Arc::new(StepWrapper { inner: S::default() }));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnyStep>> {
        self.steps.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_storage::InMemoryStreamer;

    #[derive(Default)]
    struct Add;

    #[async_trait]
    impl Step for Add {
        const NAME: &'static str = "add";
        type Input = (i64, i64);
        type Output = i64;

        async fn execute(&self, _ctx: &StepContext, (a, b): Self::Input) -> Result<i64, StepError> {
            Ok(a + b)
        }
    }

    fn context() -> StepContext {
        StepContext::new(
            RunId::generate(),
            StepId::from("step_test"),
            1,
            3,
            Arc::new(InMemoryStreamer::new()),
            StreamerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_erased_execution() {
        let mut registry = StepRegistry::new();
        registry.register::<Add>();

        let step = registry.get("add").unwrap();
        let result = step
            .execute(&context(), vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn test_invalid_input_is_fatal() {
        let mut registry = StepRegistry::new();
        registry.register::<Add>();

        let step = registry.get("add").unwrap();
        let error = step
            .execute(&context(), vec![json!("two"), json!(3)])
            .await
            .unwrap_err();
        assert!(!error.retryable);
    }

    #[test]
    fn test_step_error_conversions() {
        let error = StepError::retryable("timeout").with_code("TIMEOUT");
        let info: ErrorInfo = error.into();
        assert_eq!(info.message, "timeout");
        assert!(info.has_code("TIMEOUT"));

        let from_anyhow: StepError = anyhow::anyhow!("boom").into();
        assert!(from_anyhow.retryable);
    }

    #[test]
    fn test_is_last_attempt() {
        let ctx = StepContext::new(
            RunId::generate(),
            StepId::from("step_test"),
            3,
            3,
            Arc::new(InMemoryStreamer::new()),
            StreamerConfig::default(),
        );
        assert!(ctx.is_last_attempt());
    }
}
