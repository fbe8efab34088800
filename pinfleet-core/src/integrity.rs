//! Proof-of-replication checks, redundancy audits, and auto-repair.

use crate::config::IntegrityConfig;
use crate::error::Result;
use crate::node::NodeTarget;
use crate::persistence::{record_schema_version, FleetEvent, FleetStore};
use crate::router::ClusterRequestRouter;
use crate::storage::StorageNodeClient;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use ulid::Ulid;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Replicas required for a quorum: `ceil(total_nodes * quorum_fraction)`.
pub fn required_replicas(total_nodes: usize, quorum_fraction: f64) -> usize {
    (total_nodes as f64 * quorum_fraction).ceil() as usize
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePresence {
    pub node_id: String,
    pub present: bool,
}

/// Outcome of one proof-of-replication check. Produced fresh on every
/// call, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationAudit {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub audit_id: String,
    pub cid: String,
    pub success_count: usize,
    pub total_nodes: usize,
    pub required_replicas: usize,
    pub por_valid: bool,
    pub per_node_results: Vec<NodePresence>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyIssue {
    pub cid: String,
    pub reason: String,
}

/// Snapshot of the whole pinned set's redundancy. Regenerated wholesale
/// each audit cycle; readers always see one consistent report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyReport {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub healthy: bool,
    pub total_files: usize,
    pub verified_files: usize,
    pub issues: Vec<RedundancyIssue>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEvent {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub event_id: String,
    pub cid: String,
    pub requested_replicas: usize,
    pub success: bool,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Operator-visible signal that under-replication persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub event_id: String,
    pub code: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub failed_repairs: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub cid: String,
    pub already_sufficient: bool,
    pub repaired: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub checked: usize,
    pub already_sufficient: usize,
    pub repaired: usize,
    pub failed: usize,
}

/// Proves that pinned content is actually replicated on enough nodes and
/// drives repair when it is not.
pub struct IntegrityVerifier {
    client: Arc<dyn StorageNodeClient>,
    router: Arc<ClusterRequestRouter>,
    store: Arc<dyn FleetStore>,
    nodes: Vec<NodeTarget>,
    config: IntegrityConfig,
    current_report: RwLock<Option<RedundancyReport>>,
    events: broadcast::Sender<FleetEvent>,
    audit_guard: Mutex<()>,
    monitor_guard: Mutex<()>,
}

impl IntegrityVerifier {
    pub fn new(
        client: Arc<dyn StorageNodeClient>,
        router: Arc<ClusterRequestRouter>,
        store: Arc<dyn FleetStore>,
        nodes: Vec<NodeTarget>,
        config: IntegrityConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            router,
            store,
            nodes,
            config,
            current_report: RwLock::new(None),
            events,
            audit_guard: Mutex::new(()),
            monitor_guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub async fn current_report(&self) -> Option<RedundancyReport> {
        self.current_report.read().await.clone()
    }

    /// Query every known node for presence of `cid` and judge the result
    /// against the replication quorum. A node that errors or times out
    /// counts as absent, never as a failure of the whole check.
    pub async fn verify_por(&self, cid: &str) -> Result<ReplicationAudit> {
        let checks = self.nodes.iter().map(|node| {
            let client = &self.client;
            let presence_timeout = self.config.presence_timeout();
            async move {
                let present = match timeout(
                    presence_timeout,
                    client.fetch_presence(&node.address, cid),
                )
                .await
                {
                    Ok(Ok(present)) => present,
                    Ok(Err(error)) => {
                        tracing::debug!(
                            "Presence query for {} on {} failed: {}",
                            cid,
                            node.node_id,
                            error
                        );
                        false
                    }
                    Err(_) => false,
                };
                NodePresence {
                    node_id: node.node_id.clone(),
                    present,
                }
            }
        });
        let per_node_results = join_all(checks).await;

        let success_count = per_node_results
            .iter()
            .filter(|result| result.present)
            .count();
        let total_nodes = self.nodes.len();
        let required = required_replicas(total_nodes, self.config.quorum_fraction);

        let audit = ReplicationAudit {
            schema_version: record_schema_version(),
            audit_id: Ulid::new().to_string(),
            cid: cid.to_string(),
            success_count,
            total_nodes,
            required_replicas: required,
            por_valid: success_count >= required,
            per_node_results,
            checked_at: Utc::now(),
        };

        self.record_event(FleetEvent::Audit(audit.clone()));
        Ok(audit)
    }

    /// Run proof-of-replication over the whole pinned set and replace the
    /// current redundancy report with the fresh one.
    pub async fn audit_redundancy(&self) -> Result<RedundancyReport> {
        let _guard = self.audit_guard.lock().await;

        let pinned = self.list_pinned().await?;
        let mut issues = Vec::new();
        let mut verified_files = 0usize;

        for cid in &pinned {
            let audit = self.verify_por(cid).await?;
            if audit.por_valid {
                verified_files += 1;
            } else {
                issues.push(RedundancyIssue {
                    cid: cid.clone(),
                    reason: format!(
                        "replicas {}/{} below quorum",
                        audit.success_count, audit.required_replicas
                    ),
                });
            }
        }

        let report = RedundancyReport {
            schema_version: record_schema_version(),
            healthy: issues.is_empty(),
            total_files: pinned.len(),
            verified_files,
            issues,
            generated_at: Utc::now(),
        };

        *self.current_report.write().await = Some(report.clone());

        match serde_json::to_value(&report) {
            Ok(value) => {
                if let Err(error) = self.store.save_state("redundancy_report", &value) {
                    tracing::error!("Could not persist redundancy report: {}", error);
                }
            }
            Err(error) => {
                tracing::error!("Could not encode redundancy report: {}", error);
            }
        }

        tracing::info!(
            "Redundancy audit finished: {}/{} files verified, {} issues",
            report.verified_files,
            report.total_files,
            report.issues.len()
        );
        Ok(report)
    }

    /// Re-verify `cid` and, if it is under `min_replicas`, request a
    /// cluster re-pin through the router. A failed repair is recorded and
    /// reported, not retried here; retry cadence belongs to the monitor
    /// schedule.
    pub async fn auto_repair(&self, cid: &str, min_replicas: usize) -> Result<RepairOutcome> {
        let audit = self.verify_por(cid).await?;
        if audit.success_count >= min_replicas {
            return Ok(RepairOutcome {
                cid: cid.to_string(),
                already_sufficient: true,
                repaired: false,
                error: None,
            });
        }

        tracing::warn!(
            "Content {} under-replicated ({}/{}), requesting re-pin",
            cid,
            audit.success_count,
            min_replicas
        );

        let client = self.client.clone();
        let cid_owned = cid.to_string();
        let result = self
            .router
            .execute(move |node| {
                let client = client.clone();
                let cid = cid_owned.clone();
                async move { client.pin(&node.address, &cid).await }
            })
            .await;

        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(error) => (false, Some(error.to_string())),
        };

        self.record_event(FleetEvent::Repair(RepairEvent {
            schema_version: record_schema_version(),
            event_id: Ulid::new().to_string(),
            cid: cid.to_string(),
            requested_replicas: min_replicas,
            success,
            detail: error.clone(),
            timestamp: Utc::now(),
        }));

        Ok(RepairOutcome {
            cid: cid.to_string(),
            already_sufficient: false,
            repaired: success,
            error,
        })
    }

    /// Walk the pinned set, repair anything under `min_replicas`, and
    /// raise a NODE_FAILURE alert when repairs fail. Severity escalates to
    /// critical once failures reach `alert_failed_repairs`.
    pub async fn monitor_replication_factor(&self, min_replicas: usize) -> Result<MonitorSummary> {
        let _guard = self.monitor_guard.lock().await;

        let pinned = self.list_pinned().await?;
        let mut already_sufficient = 0usize;
        let mut repaired = 0usize;
        let mut failed = 0usize;

        for cid in &pinned {
            let outcome = self.auto_repair(cid, min_replicas).await?;
            if outcome.already_sufficient {
                already_sufficient += 1;
            } else if outcome.repaired {
                repaired += 1;
            } else {
                failed += 1;
            }
        }

        if failed > 0 {
            let severity = if failed >= self.config.alert_failed_repairs {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            self.record_event(FleetEvent::Alert(AlertEvent {
                schema_version: record_schema_version(),
                event_id: Ulid::new().to_string(),
                code: "NODE_FAILURE".to_string(),
                severity,
                message: format!(
                    "{} of {} pinned items could not be restored to {} replicas",
                    failed,
                    pinned.len(),
                    min_replicas
                ),
                failed_repairs: failed,
                timestamp: Utc::now(),
            }));
        }

        Ok(MonitorSummary {
            checked: pinned.len(),
            already_sufficient,
            repaired,
            failed,
        })
    }

    async fn list_pinned(&self) -> Result<Vec<String>> {
        let client = self.client.clone();
        self.router
            .execute(move |node| {
                let client = client.clone();
                async move { client.list_pins(&node.address).await }
            })
            .await
    }

    fn record_event(&self, event: FleetEvent) {
        if let Err(error) = self.store.append_event(&event) {
            tracing::error!("Could not persist {} event: {}", event.kind(), error);
        }
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::error::FleetError;
    use crate::probe::HealthProbe;
    use crate::testutil::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct PresenceSim {
        pinset: StdMutex<Vec<String>>,
        presence: StdMutex<HashMap<String, HashSet<String>>>,
        fail_pins: StdMutex<bool>,
        pin_calls: StdMutex<Vec<(String, String)>>,
    }

    impl PresenceSim {
        fn seed_pinset(&self, cids: &[&str]) {
            *self.pinset.lock().unwrap() = cids.iter().map(|cid| cid.to_string()).collect();
        }

        fn set_present(&self, address: &str, cid: &str) {
            self.presence
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .insert(cid.to_string());
        }
    }

    #[async_trait]
    impl StorageNodeClient for PresenceSim {
        async fn health_check(&self, _address: &str) -> crate::error::Result<bool> {
            Ok(true)
        }

        async fn list_pins(&self, _address: &str) -> crate::error::Result<Vec<String>> {
            Ok(self.pinset.lock().unwrap().clone())
        }

        async fn pin(&self, address: &str, cid: &str) -> crate::error::Result<()> {
            if *self.fail_pins.lock().unwrap() {
                return Err(FleetError::Http("pin rejected".to_string()));
            }
            self.pin_calls
                .lock()
                .unwrap()
                .push((address.to_string(), cid.to_string()));
            self.set_present(address, cid);
            Ok(())
        }

        async fn unpin(&self, _address: &str, _cid: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn fetch_presence(&self, address: &str, cid: &str) -> crate::error::Result<bool> {
            Ok(self
                .presence
                .lock()
                .unwrap()
                .get(address)
                .map(|cids| cids.contains(cid))
                .unwrap_or(false))
        }

        async fn add_content(&self, _address: &str, _data: Bytes) -> crate::error::Result<String> {
            Ok("bafy-new".to_string())
        }
    }

    fn five_targets() -> Vec<NodeTarget> {
        ["a", "b", "c", "d", "e"]
            .iter()
            .enumerate()
            .map(|(index, name)| NodeTarget {
                node_id: name.to_string(),
                address: format!("10.0.0.{}:5001", index + 1),
            })
            .collect()
    }

    fn verifier_with(
        sim: Arc<PresenceSim>,
        store: Arc<MemoryStore>,
    ) -> IntegrityVerifier {
        let probe = HealthProbe::new(sim.clone(), Duration::from_millis(100));
        let router = Arc::new(ClusterRequestRouter::new(
            probe,
            five_targets(),
            RouterConfig {
                max_retries: 1,
                ..RouterConfig::default()
            },
        ));
        IntegrityVerifier::new(sim, router, store, five_targets(), IntegrityConfig::default())
    }

    #[test]
    fn test_required_replicas_rounds_up() {
        assert_eq!(required_replicas(5, 0.6), 3);
        assert_eq!(required_replicas(4, 0.6), 3);
        assert_eq!(required_replicas(10, 0.6), 6);
        assert_eq!(required_replicas(1, 0.6), 1);
        assert_eq!(required_replicas(0, 0.6), 0);
    }

    #[tokio::test]
    async fn test_por_passes_with_three_of_five_nodes() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store);

        sim.set_present("10.0.0.1:5001", "bafy-x");
        sim.set_present("10.0.0.2:5001", "bafy-x");
        sim.set_present("10.0.0.4:5001", "bafy-x");

        let audit = verifier.verify_por("bafy-x").await.unwrap();
        assert_eq!(audit.total_nodes, 5);
        assert_eq!(audit.required_replicas, 3);
        assert_eq!(audit.success_count, 3);
        assert!(audit.por_valid);
    }

    #[tokio::test]
    async fn test_por_fails_with_two_of_five_nodes() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store.clone());

        sim.set_present("10.0.0.1:5001", "bafy-x");
        sim.set_present("10.0.0.5:5001", "bafy-x");

        let audit = verifier.verify_por("bafy-x").await.unwrap();
        assert_eq!(audit.success_count, 2);
        assert!(!audit.por_valid);

        // The audit record lands in the append-only log.
        assert_eq!(store.count_kind("audit"), 1);
    }

    #[tokio::test]
    async fn test_audit_replaces_report_wholesale() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store);

        sim.seed_pinset(&["bafy-1", "bafy-2"]);
        for address in ["10.0.0.1:5001", "10.0.0.2:5001", "10.0.0.3:5001"] {
            sim.set_present(address, "bafy-1");
        }

        let report = verifier.audit_redundancy().await.unwrap();
        assert!(!report.healthy);
        assert_eq!(report.total_files, 2);
        assert_eq!(report.verified_files, 1);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].cid, "bafy-2");

        // Replicate the missing file, re-audit: the old report is gone.
        for address in ["10.0.0.1:5001", "10.0.0.2:5001", "10.0.0.3:5001"] {
            sim.set_present(address, "bafy-2");
        }
        let report = verifier.audit_redundancy().await.unwrap();
        assert!(report.healthy);
        assert!(report.issues.is_empty());

        let current = verifier.current_report().await.unwrap();
        assert!(current.healthy);
    }

    #[tokio::test]
    async fn test_auto_repair_is_noop_when_sufficient() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store.clone());

        for address in ["10.0.0.1:5001", "10.0.0.2:5001", "10.0.0.3:5001"] {
            sim.set_present(address, "bafy-x");
        }

        let outcome = verifier.auto_repair("bafy-x", 3).await.unwrap();
        assert!(outcome.already_sufficient);
        assert!(!outcome.repaired);
        assert!(sim.pin_calls.lock().unwrap().is_empty());
        assert_eq!(store.count_kind("repair"), 0);
    }

    #[tokio::test]
    async fn test_auto_repair_repins_under_replicated_content() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store.clone());

        sim.set_present("10.0.0.1:5001", "bafy-x");

        let outcome = verifier.auto_repair("bafy-x", 3).await.unwrap();
        assert!(!outcome.already_sufficient);
        assert!(outcome.repaired);
        assert_eq!(sim.pin_calls.lock().unwrap().len(), 1);
        assert_eq!(store.count_kind("repair"), 1);
    }

    #[tokio::test]
    async fn test_monitor_escalates_alert_after_repeated_repair_failures() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store.clone());

        sim.seed_pinset(&["bafy-1", "bafy-2", "bafy-3"]);
        *sim.fail_pins.lock().unwrap() = true;

        let summary = verifier.monitor_replication_factor(3).await.unwrap();
        assert_eq!(summary.checked, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.repaired, 0);

        let events = store.events.lock().unwrap();
        let alert = events
            .iter()
            .find_map(|event| match event {
                FleetEvent::Alert(alert) => Some(alert.clone()),
                _ => None,
            })
            .expect("alert expected");
        assert_eq!(alert.code, "NODE_FAILURE");
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.failed_repairs, 3);
    }

    #[tokio::test]
    async fn test_monitor_repairs_and_reports_counts() {
        let sim = Arc::new(PresenceSim::default());
        let store = Arc::new(MemoryStore::default());
        let verifier = verifier_with(sim.clone(), store.clone());

        sim.seed_pinset(&["bafy-ok", "bafy-thin"]);
        for address in ["10.0.0.1:5001", "10.0.0.2:5001", "10.0.0.3:5001"] {
            sim.set_present(address, "bafy-ok");
        }
        sim.set_present("10.0.0.1:5001", "bafy-thin");

        let summary = verifier.monitor_replication_factor(3).await.unwrap();
        assert_eq!(summary.already_sufficient, 1);
        assert_eq!(summary.repaired, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(store.count_kind("alert"), 0);
    }
}
