use crate::storage::StorageNodeClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Outcome of a single liveness probe. Probes never fail: network errors
/// and timeouts resolve to `healthy = false`.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub healthy: bool,
    pub response_time_ms: u64,
}

/// Bounded-time liveness check against one storage node.
#[derive(Clone)]
pub struct HealthProbe {
    client: Arc<dyn StorageNodeClient>,
    probe_timeout: Duration,
}

impl HealthProbe {
    pub fn new(client: Arc<dyn StorageNodeClient>, probe_timeout: Duration) -> Self {
        Self {
            client,
            probe_timeout,
        }
    }

    pub async fn probe(&self, address: &str) -> ProbeReport {
        let started = Instant::now();

        let healthy = match timeout(self.probe_timeout, self.client.health_check(address)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(error)) => {
                tracing::debug!("Probe of {} failed: {}", address, error);
                false
            }
            Err(_) => {
                tracing::debug!(
                    "Probe of {} timed out after {:?}",
                    address,
                    self.probe_timeout
                );
                false
            }
        };

        ProbeReport {
            healthy,
            response_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}
