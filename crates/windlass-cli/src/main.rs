// Windlass CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: The health command is the only surface here; everything
// else is library API.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use windlass_core::HealthEndpoint;
use windlass_runtime::{HealthReport, Runtime};
use windlass_storage::World;

#[derive(Parser)]
#[command(name = "windlass")]
#[command(about = "Windlass - durable workflow runtime")]
#[command(version)]
struct Cli {
    /// Suppress non-essential output
    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify that the workflow and step queue handlers are live
    Health {
        /// Which endpoint(s) to probe
        #[arg(long, default_value = "both")]
        endpoint: EndpointArg,

        /// Probe timeout in milliseconds
        #[arg(long, default_value_t = 5_000)]
        timeout: u64,

        /// World backend to probe
        #[arg(long, env = "WINDLASS_BACKEND", default_value = "memory")]
        backend: String,

        /// Emit the reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EndpointArg {
    Workflow,
    Step,
    Both,
}

impl EndpointArg {
    fn endpoints(self) -> Vec<HealthEndpoint> {
        match self {
            Self::Workflow => vec![HealthEndpoint::Workflow],
            Self::Step => vec![HealthEndpoint::Step],
            Self::Both => vec![HealthEndpoint::Workflow, HealthEndpoint::Step],
        }
    }
}

fn world_for_backend(backend: &str) -> anyhow::Result<World> {
    match backend {
        "memory" => Ok(World::in_memory()),
        other => anyhow::bail!("unknown backend: {other} (available: memory)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match cli.command {
        Commands::Health {
            endpoint,
            timeout,
            backend,
            json,
        } => {
            let world = world_for_backend(&backend)?;
            let runtime = std::sync::Arc::new(Runtime::new(world));

            // Drain the queue in the background so probes can round-trip.
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let worker = {
                let runtime = std::sync::Arc::clone(&runtime);
                tokio::spawn(async move { runtime.serve(shutdown_rx).await })
            };

            let timeout = Duration::from_millis(timeout);
            let mut reports: Vec<HealthReport> = vec![];
            for target in endpoint.endpoints() {
                reports.push(runtime.health_check(target, timeout).await);
            }

            shutdown_tx.send(true).ok();
            worker.await.context("worker loop panicked")?;

            let all_healthy = reports.iter().all(|report| report.healthy);

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if !cli.quiet {
                for report in &reports {
                    match (&report.healthy, &report.error) {
                        (true, _) => {
                            println!("{}: healthy ({}ms)", report.endpoint, report.latency_ms)
                        }
                        (false, Some(error)) => {
                            println!("{}: unhealthy - {error}", report.endpoint)
                        }
                        (false, None) => println!("{}: unhealthy", report.endpoint),
                    }
                }
            }

            if !all_healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
