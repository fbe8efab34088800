use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health sweep and failover tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Consecutive probe failures before a node is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Backup nodes selected per failover trigger.
    #[serde(default = "default_backup_node_cap")]
    pub backup_node_cap: usize,
    /// Failover re-replicates at most this many pinned items per trigger.
    /// The remainder is left to the redundancy audit schedule; whether that
    /// load-shedding is acceptable is an open operational question.
    #[serde(default = "default_replication_cap")]
    pub replication_cap: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
            backup_node_cap: default_backup_node_cap(),
            replication_cap: default_replication_cap(),
        }
    }
}

impl HealthMonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Retry/backoff tuning for routed cluster operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl RouterConfig {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    /// Delay before the next attempt: `min(base * 2^(attempt-1), cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }
}

/// Proof-of-replication and audit tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Fraction of all known nodes that must hold a copy for PoR to pass.
    /// The 0.6 default has no documented rationale; treat it as tunable.
    #[serde(default = "default_quorum_fraction")]
    pub quorum_fraction: f64,
    #[serde(default = "default_presence_timeout_ms")]
    pub presence_timeout_ms: u64,
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,
    /// Failed repairs in one monitor pass at or above this count escalate
    /// the alert severity to critical.
    #[serde(default = "default_alert_failed_repairs")]
    pub alert_failed_repairs: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            quorum_fraction: default_quorum_fraction(),
            presence_timeout_ms: default_presence_timeout_ms(),
            audit_interval_secs: default_audit_interval_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            min_replicas: default_min_replicas(),
            alert_failed_repairs: default_alert_failed_repairs(),
        }
    }
}

impl IntegrityConfig {
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Provider link and registry tuning, shared by both ends of the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A provider whose last heartbeat is older than this is reported
    /// offline. The 60 s default has no documented rationale; treat it as
    /// tunable.
    #[serde(default = "default_heartbeat_staleness_secs")]
    pub heartbeat_staleness_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_staleness_secs: default_heartbeat_staleness_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl ProviderConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_staleness_secs as i64)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Per-type completion timeouts for the provider job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    #[serde(default = "default_pin_timeout_secs")]
    pub pin_timeout_secs: u64,
    #[serde(default = "default_unpin_timeout_secs")]
    pub unpin_timeout_secs: u64,
    #[serde(default = "default_contract_timeout_secs")]
    pub contract_timeout_secs: u64,
    /// Pause between finishing one job and starting the next.
    #[serde(default = "default_inter_job_delay_ms")]
    pub inter_job_delay_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            pin_timeout_secs: default_pin_timeout_secs(),
            unpin_timeout_secs: default_unpin_timeout_secs(),
            contract_timeout_secs: default_contract_timeout_secs(),
            inter_job_delay_ms: default_inter_job_delay_ms(),
        }
    }
}

impl JobQueueConfig {
    pub fn inter_job_delay(&self) -> Duration {
        Duration::from_millis(self.inter_job_delay_ms)
    }
}

/// Aggregate configuration for all fleet services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub health: HealthMonitorConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub jobs: JobQueueConfig,
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_backup_node_cap() -> usize {
    3
}

fn default_replication_cap() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_per_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    5_000
}

fn default_quorum_fraction() -> f64 {
    0.6
}

fn default_presence_timeout_ms() -> u64 {
    3_000
}

fn default_audit_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_monitor_interval_secs() -> u64 {
    30 * 60
}

fn default_min_replicas() -> usize {
    3
}

fn default_alert_failed_repairs() -> usize {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_staleness_secs() -> u64 {
    60
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_pin_timeout_secs() -> u64 {
    5 * 60
}

fn default_unpin_timeout_secs() -> u64 {
    60
}

fn default_contract_timeout_secs() -> u64 {
    10 * 60
}

fn default_inter_job_delay_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_caps() {
        let config = RouterConfig::default();

        assert_eq!(config.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(5_000));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_defaults_from_empty_config() {
        let config: FleetConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.health.replication_cap, 10);
        assert_eq!(config.integrity.quorum_fraction, 0.6);
        assert_eq!(config.provider.heartbeat_staleness_secs, 60);
        assert_eq!(config.jobs.pin_timeout_secs, 300);
    }
}
