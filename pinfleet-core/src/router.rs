//! Routed execution of cluster operations: pick the first healthy node in
//! a fixed-order set, run the operation with a bounded timeout, retry with
//! exponential backoff across attempts.

use crate::config::RouterConfig;
use crate::error::{FleetError, Result};
use crate::node::NodeTarget;
use crate::probe::HealthProbe;
use std::future::Future;
use tokio::time::{sleep, timeout};

pub struct ClusterRequestRouter {
    probe: HealthProbe,
    nodes: Vec<NodeTarget>,
    config: RouterConfig,
}

impl ClusterRequestRouter {
    pub fn new(probe: HealthProbe, nodes: Vec<NodeTarget>, config: RouterConfig) -> Self {
        Self {
            probe,
            nodes,
            config,
        }
    }

    pub fn nodes(&self) -> &[NodeTarget] {
        &self.nodes
    }

    /// Run `operation` against the first healthy node, retrying up to
    /// `max_retries` attempts with backoff between them.
    ///
    /// Delivery is at-least-once: a retried attempt may repeat a side
    /// effect that succeeded just before a response was lost. Mutating
    /// operations routed here must be idempotent (content-addressed pins
    /// are) or tolerate duplicates.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(NodeTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_retries {
            match self.attempt(&operation).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::warn!(
                        "Routed operation attempt {}/{} failed: {}",
                        attempt,
                        self.config.max_retries,
                        error
                    );
                    last_error = error.to_string();
                }
            }

            if attempt < self.config.max_retries {
                sleep(self.config.backoff_delay(attempt)).await;
            }
        }

        Err(FleetError::ExhaustedRetries {
            attempts: self.config.max_retries,
            last_error,
        })
    }

    async fn attempt<T, F, Fut>(&self, operation: &F) -> Result<T>
    where
        F: Fn(NodeTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for node in &self.nodes {
            if !self.probe.probe(&node.address).await.healthy {
                continue;
            }

            return match timeout(
                self.config.per_attempt_timeout(),
                operation(node.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FleetError::Timeout(format!(
                    "operation on node {} exceeded {:?}",
                    node.node_id,
                    self.config.per_attempt_timeout()
                ))),
            };
        }

        Err(FleetError::NoHealthyNode)
    }
}
