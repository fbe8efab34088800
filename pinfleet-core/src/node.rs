use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A storage node in the configured cluster set, as addressed by the
/// router and the health sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeTarget {
    pub node_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    FailoverCompleted,
}

impl NodeStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeStatus::Healthy)
    }
}

/// Health-tracking record for one storage node. Owned by the failover
/// manager; mutated only by the sweep routine and manual recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default = "crate::persistence::record_schema_version")]
    pub schema_version: u32,
    pub node_id: String,
    pub address: String,
    pub status: NodeStatus,
    pub consecutive_failures: u32,
    pub response_time_ms: Option<u64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(target: &NodeTarget) -> Self {
        Self {
            schema_version: crate::persistence::record_schema_version(),
            node_id: target.node_id.clone(),
            address: target.address.clone(),
            status: NodeStatus::Healthy,
            consecutive_failures: 0,
            response_time_ms: None,
            last_checked_at: None,
            recovered_at: None,
        }
    }
}
