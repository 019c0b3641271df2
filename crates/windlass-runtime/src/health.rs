//! Health-check protocol
//!
//! End-to-end liveness verification: a distinguished probe message travels
//! through the normal queue, and its acknowledgment by the message
//! processor resolves a nonce rendez-vous on the caller side.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use windlass_core::{HealthEndpoint, QueueMessage};
use windlass_storage::{Queue, SendOptions};

/// Result of probing one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub endpoint: HealthEndpoint,
    pub healthy: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub latency_ms: u64,
}

/// Caller-side nonce table; the processor resolves entries when it sees the
/// probe come back through the queue.
#[derive(Default)]
pub struct HealthRendezvous {
    waiters: DashMap<String, oneshot::Sender<()>>,
}

impl HealthRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, nonce: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(nonce.to_string(), tx);
        rx
    }

    /// Called by the message processor when it handles a probe.
    pub(crate) fn resolve(&self, nonce: &str) {
        if let Some((_, tx)) = self.waiters.remove(nonce) {
            debug!(nonce, "health probe acknowledged");
            let _ = tx.send(());
        }
    }

    pub(crate) fn forget(&self, nonce: &str) {
        self.waiters.remove(nonce);
    }
}

/// Sends probes and waits for their acknowledgment.
pub struct HealthChecker {
    queue: std::sync::Arc<dyn Queue>,
    rendezvous: std::sync::Arc<HealthRendezvous>,
}

impl HealthChecker {
    pub(crate) fn new(
        queue: std::sync::Arc<dyn Queue>,
        rendezvous: std::sync::Arc<HealthRendezvous>,
    ) -> Self {
        Self { queue, rendezvous }
    }

    /// Probe one endpoint, waiting up to `timeout` for the acknowledgment.
    pub async fn check(&self, endpoint: HealthEndpoint, timeout: Duration) -> HealthReport {
        let nonce = format!("hc_{}", Ulid::new());
        let receiver = self.rendezvous.register(&nonce);
        let started = Instant::now();

        let sent = self
            .queue
            .send(
                QueueMessage::HealthCheck {
                    endpoint,
                    nonce: nonce.clone(),
                },
                SendOptions::default(),
            )
            .await;

        if let Err(error) = sent {
            self.rendezvous.forget(&nonce);
            return HealthReport {
                endpoint,
                healthy: false,
                error: Some(error.to_string()),
                latency_ms: started.elapsed().as_millis() as u64,
            };
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(())) => HealthReport {
                endpoint,
                healthy: true,
                error: None,
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(_)) => {
                self.rendezvous.forget(&nonce);
                HealthReport {
                    endpoint,
                    healthy: false,
                    error: Some("probe channel dropped".to_string()),
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(_) => {
                self.rendezvous.forget(&nonce);
                HealthReport {
                    endpoint,
                    healthy: false,
                    error: Some("timeout".to_string()),
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use windlass_storage::InMemoryQueue;

    #[tokio::test]
    async fn test_timeout_reports_unhealthy() {
        // No processor is draining the queue, so the probe must time out.
        let checker = HealthChecker::new(
            Arc::new(InMemoryQueue::new()),
            Arc::new(HealthRendezvous::new()),
        );

        let report = checker
            .check(HealthEndpoint::Workflow, Duration::from_millis(30))
            .await;
        assert!(!report.healthy);
        assert_eq!(report.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_resolution_reports_healthy() {
        let queue = Arc::new(InMemoryQueue::new());
        let rendezvous = Arc::new(HealthRendezvous::new());
        let checker = HealthChecker::new(queue.clone(), rendezvous.clone());

        // Simulate the processor acknowledging the probe.
        let ack_side = rendezvous.clone();
        let ack_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(Some(delivery)) = ack_queue.pop(windlass_core::queues::STEP).await {
                    if let QueueMessage::HealthCheck { nonce, .. } = &delivery.message {
                        ack_side.resolve(nonce);
                        let _ = ack_queue.ack(&delivery.meta.message_id).await;
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let report = checker
            .check(HealthEndpoint::Step, Duration::from_secs(1))
            .await;
        assert!(report.healthy);
        assert!(report.error.is_none());
    }
}
