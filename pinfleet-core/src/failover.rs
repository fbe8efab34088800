//! Node health sweeps, debounced failure detection, and failover with
//! bounded re-replication.

use crate::config::HealthMonitorConfig;
use crate::error::{FleetError, Result};
use crate::node::{NodeRecord, NodeStatus, NodeTarget};
use crate::persistence::{record_schema_version, FleetEvent, FleetStore};
use crate::probe::HealthProbe;
use crate::storage::StorageNodeClient;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use ulid::Ulid;

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    Completed,
    NoHealthyNodes,
    ListPinsFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepinResult {
    pub cid: String,
    pub success: bool,
}

/// Append-only record of one failover trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub event_id: String,
    pub failed_node_id: String,
    pub failed_address: String,
    pub timestamp: DateTime<Utc>,
    pub files_affected: usize,
    pub backup_node_count: usize,
    pub per_file_results: Vec<RepinResult>,
    pub status: FailoverStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub event_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub skipped: bool,
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub failovers_triggered: usize,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            probed: 0,
            healthy: 0,
            unhealthy: 0,
            failovers_triggered: 0,
        }
    }
}

/// Tracks reachability of every known storage node and fails traffic away
/// from nodes that miss `unhealthy_threshold` consecutive probes.
///
/// Degradation is automatic; recovery is only ever triggered by an
/// operator through [`FailoverManager::recover`]. A node that probes
/// healthy again stays out of rotation until recovered.
pub struct FailoverManager {
    probe: HealthProbe,
    client: Arc<dyn StorageNodeClient>,
    store: Arc<dyn FleetStore>,
    config: HealthMonitorConfig,
    nodes: RwLock<HashMap<String, NodeRecord>>,
    node_order: Vec<String>,
    events: broadcast::Sender<FleetEvent>,
    sweep_guard: Mutex<()>,
}

impl FailoverManager {
    pub fn new(
        targets: Vec<NodeTarget>,
        client: Arc<dyn StorageNodeClient>,
        store: Arc<dyn FleetStore>,
        config: HealthMonitorConfig,
    ) -> Self {
        let probe = HealthProbe::new(client.clone(), config.probe_timeout());
        let node_order: Vec<String> = targets.iter().map(|target| target.node_id.clone()).collect();
        let nodes = targets
            .iter()
            .map(|target| (target.node_id.clone(), NodeRecord::new(target)))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            probe,
            client,
            store,
            config,
            nodes: RwLock::new(nodes),
            node_order,
            events,
            sweep_guard: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub async fn nodes(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().await;
        self.node_order
            .iter()
            .filter_map(|node_id| nodes.get(node_id).cloned())
            .collect()
    }

    pub async fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<FleetEvent>> {
        self.store.recent_events(limit)
    }

    /// Probe every known node concurrently, update the record table in one
    /// atomic publish, and trigger failover for nodes that crossed the
    /// unhealthy threshold in this sweep.
    ///
    /// A sweep that finds another sweep in flight returns a skipped report
    /// instead of overlapping it.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            tracing::debug!("Health sweep already in flight, skipping this tick");
            return Ok(SweepReport::skipped());
        };

        let targets: Vec<(String, String)> = {
            let nodes = self.nodes.read().await;
            self.node_order
                .iter()
                .filter_map(|node_id| {
                    nodes
                        .get(node_id)
                        .map(|record| (record.node_id.clone(), record.address.clone()))
                })
                .collect()
        };

        let probes = targets.into_iter().map(|(node_id, address)| {
            let probe = &self.probe;
            async move {
                let report = probe.probe(&address).await;
                (node_id, report)
            }
        });
        let reports = join_all(probes).await;

        let mut healthy_count = 0usize;
        let mut unhealthy_count = 0usize;
        let mut newly_unhealthy = Vec::new();
        let probed = reports.len();

        {
            let mut nodes = self.nodes.write().await;
            for (node_id, report) in reports {
                let Some(record) = nodes.get_mut(&node_id) else {
                    continue;
                };

                record.last_checked_at = Some(Utc::now());

                if report.healthy {
                    healthy_count += 1;
                    record.consecutive_failures = 0;
                    record.response_time_ms = Some(report.response_time_ms);
                } else {
                    unhealthy_count += 1;
                    record.consecutive_failures += 1;
                    record.response_time_ms = None;

                    if record.status == NodeStatus::Healthy
                        && record.consecutive_failures >= self.config.unhealthy_threshold
                    {
                        record.status = NodeStatus::Unhealthy;
                        newly_unhealthy.push(node_id.clone());
                    }
                }
            }
        }

        self.persist_node_table().await;

        let mut failovers_triggered = 0usize;
        for node_id in &newly_unhealthy {
            tracing::warn!(
                "Node {} crossed {} consecutive failures, triggering failover",
                node_id,
                self.config.unhealthy_threshold
            );
            match self.trigger_failover(node_id).await {
                Ok(_) => failovers_triggered += 1,
                Err(error) => {
                    tracing::error!("Failover for node {} failed: {}", node_id, error);
                }
            }
        }

        Ok(SweepReport {
            skipped: false,
            probed,
            healthy: healthy_count,
            unhealthy: unhealthy_count,
            failovers_triggered,
        })
    }

    /// Re-establish redundancy for content pinned on a node judged dead:
    /// select up to `backup_node_cap` healthy nodes and re-pin at most the
    /// first `replication_cap` pinned items onto them. The remainder of a
    /// large pin set is left to the redundancy audit cycle.
    pub async fn trigger_failover(&self, node_id: &str) -> Result<FailoverEvent> {
        let (failed_address, backups) = {
            let nodes = self.nodes.read().await;
            let failed = nodes
                .get(node_id)
                .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;

            let backups: Vec<NodeTarget> = self
                .node_order
                .iter()
                .filter_map(|candidate_id| nodes.get(candidate_id))
                .filter(|record| record.node_id != node_id && record.status.is_healthy())
                .take(self.config.backup_node_cap)
                .map(|record| NodeTarget {
                    node_id: record.node_id.clone(),
                    address: record.address.clone(),
                })
                .collect();

            (failed.address.clone(), backups)
        };

        if backups.is_empty() {
            tracing::error!(
                "No healthy backup nodes available for failover of {}",
                node_id
            );
            let event = self.build_event(node_id, &failed_address, 0, Vec::new(), FailoverStatus::NoHealthyNodes);
            self.record_event(FleetEvent::Failover(event.clone()));
            return Ok(event);
        }

        let pinned = match self.client.list_pins(&backups[0].address).await {
            Ok(pinned) => pinned,
            Err(error) => {
                tracing::error!(
                    "Could not enumerate pinned content for failover of {}: {}",
                    node_id,
                    error
                );
                let event = self.build_event(
                    node_id,
                    &failed_address,
                    backups.len(),
                    Vec::new(),
                    FailoverStatus::ListPinsFailed,
                );
                self.record_event(FleetEvent::Failover(event.clone()));
                return Ok(event);
            }
        };

        let mut per_file_results = Vec::new();
        for cid in pinned.into_iter().take(self.config.replication_cap) {
            let mut replicated = false;
            for backup in &backups {
                match self.client.pin(&backup.address, &cid).await {
                    Ok(()) => replicated = true,
                    Err(error) => {
                        tracing::warn!(
                            "Re-pin of {} onto {} failed: {}",
                            cid,
                            backup.node_id,
                            error
                        );
                    }
                }
            }
            per_file_results.push(RepinResult {
                cid,
                success: replicated,
            });
        }

        {
            let mut nodes = self.nodes.write().await;
            if let Some(record) = nodes.get_mut(node_id) {
                record.status = NodeStatus::FailoverCompleted;
            }
        }
        self.persist_node_table().await;

        let event = self.build_event(
            node_id,
            &failed_address,
            backups.len(),
            per_file_results,
            FailoverStatus::Completed,
        );
        tracing::info!(
            "Failover of {} completed: {} files re-replicated across {} backup nodes",
            node_id,
            event.files_affected,
            event.backup_node_count
        );
        self.record_event(FleetEvent::Failover(event.clone()));

        Ok(event)
    }

    /// Operator-triggered recovery: reset the failure counter and put the
    /// node back into rotation. Never invoked automatically.
    pub async fn recover(&self, node_id: &str) -> Result<NodeRecord> {
        let record = {
            let mut nodes = self.nodes.write().await;
            let record = nodes
                .get_mut(node_id)
                .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;

            record.consecutive_failures = 0;
            record.status = NodeStatus::Healthy;
            record.recovered_at = Some(Utc::now());
            record.clone()
        };

        self.persist_node_table().await;

        tracing::info!("Node {} manually recovered", node_id);
        self.record_event(FleetEvent::Recovery(RecoveryEvent {
            schema_version: record_schema_version(),
            event_id: Ulid::new().to_string(),
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
        }));

        Ok(record)
    }

    fn build_event(
        &self,
        node_id: &str,
        failed_address: &str,
        backup_node_count: usize,
        per_file_results: Vec<RepinResult>,
        status: FailoverStatus,
    ) -> FailoverEvent {
        FailoverEvent {
            schema_version: record_schema_version(),
            event_id: Ulid::new().to_string(),
            failed_node_id: node_id.to_string(),
            failed_address: failed_address.to_string(),
            timestamp: Utc::now(),
            files_affected: per_file_results.len(),
            backup_node_count,
            per_file_results,
            status,
        }
    }

    /// Append to the audit trail and notify subscribers. Persistence
    /// failures are logged and never unwind the in-memory transition.
    fn record_event(&self, event: FleetEvent) {
        if let Err(error) = self.store.append_event(&event) {
            tracing::error!("Could not persist {} event: {}", event.kind(), error);
        }
        let _ = self.events.send(event);
    }

    async fn persist_node_table(&self) {
        let records: Vec<NodeRecord> = self.nodes().await;
        match serde_json::to_value(&records) {
            Ok(value) => {
                if let Err(error) = self.store.save_state("node_records", &value) {
                    tracing::error!("Could not persist node record table: {}", error);
                }
            }
            Err(error) => {
                tracing::error!("Could not encode node record table: {}", error);
            }
        }
    }
}
