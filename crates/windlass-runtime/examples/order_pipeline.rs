//! A small end-to-end tour: steps, a durable sleep, retries, and a stream.
//!
//! Run with: `cargo run --example order_pipeline`

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use windlass_core::RetryPolicy;
use windlass_runtime::prelude::*;
use windlass_runtime::{Interrupt, StepContext, WorkflowContext};
use windlass_storage::{ListEventsParams, Storage};

#[derive(Default)]
struct ReserveInventory;

#[async_trait]
impl Step for ReserveInventory {
    const NAME: &'static str = "reserve_inventory";
    type Input = (String, u32);
    type Output = Value;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(50), 3)
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        (sku, quantity): Self::Input,
    ) -> Result<Value, StepError> {
        // Pretend the warehouse service is flaky on the first call.
        if ctx.attempt == 1 {
            return Err(StepError::retryable("warehouse unavailable"));
        }
        Ok(json!({ "sku": sku, "reserved": quantity }))
    }
}

#[derive(Default)]
struct EmitInvoice;

#[async_trait]
impl Step for EmitInvoice {
    const NAME: &'static str = "emit_invoice";
    type Input = Value;
    type Output = Value;

    async fn execute(&self, ctx: &StepContext, reservation: Value) -> Result<Value, StepError> {
        let lines = ctx.create_stream(Some("invoice"));
        for line in ["header", "items", "total"] {
            lines
                .write(Bytes::from(format!("{line}\n")))
                .await
                .map_err(|error| StepError::retryable(error.to_string()))?;
        }
        lines
            .close()
            .await
            .map_err(|error| StepError::retryable(error.to_string()))?;

        Ok(json!({
            "reservation": reservation,
            "invoice": lines.stream_ref().to_value(),
        }))
    }
}

#[derive(Default)]
struct OrderPipeline;

impl Workflow for OrderPipeline {
    const NAME: &'static str = "order_pipeline";
    type Input = (String, u32);
    type Output = Value;

    fn run(
        &self,
        ctx: &mut WorkflowContext,
        (sku, quantity): Self::Input,
    ) -> Result<Value, Interrupt> {
        let reservation = ctx.step("reserve_inventory", vec![json!(sku), json!(quantity)])?;

        // Give the payment provider a moment to settle.
        ctx.sleep(Duration::from_millis(100))?;

        ctx.step("emit_invoice", vec![reservation])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("windlass_runtime=info")
        .init();

    let runtime = Runtime::new(World::in_memory());
    runtime.register_workflow::<OrderPipeline>();
    runtime.register_step::<ReserveInventory>();
    runtime.register_step::<EmitInvoice>();

    let run_id = runtime
        .start::<OrderPipeline>(("SKU-42".to_string(), 3), StartOptions::default())
        .await?;
    runtime.run_until_idle().await;

    let run = runtime.world().storage.run_get(&run_id).await?;
    println!("run {} finished as {}", run.run_id, run.status);
    println!("output: {}", serde_json::to_string_pretty(&run.output)?);

    let events = runtime
        .world()
        .storage
        .events_list(ListEventsParams::for_run(run_id.clone()))
        .await?;
    println!("event log:");
    for event in &events.items {
        println!("  {} {}", event.event_id, event.event_type());
    }

    if let Some(stream_ref) = run
        .output
        .as_ref()
        .and_then(|output| output.get("invoice"))
        .and_then(StreamRef::from_value)
    {
        let mut chunks = runtime.read_stream(&run_id, &stream_ref, 0).await?;
        print!("invoice stream: ");
        while let Some(chunk) = chunks.next().await {
            print!("{}", String::from_utf8_lossy(&chunk.data));
        }
    }

    Ok(())
}
