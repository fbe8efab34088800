use pinfleet_core::{FleetConfig, FleetError, NodeTarget, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub schedules: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: String,
    pub address: String,
}

impl NodeEntry {
    pub fn to_target(&self) -> NodeTarget {
        NodeTarget {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer tokens accepted from connecting providers.
    #[serde(default)]
    pub provider_tokens: Vec<String>,
}

/// Which periodic loops start with the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub health_monitor: bool,
    #[serde(default = "default_true")]
    pub integrity: bool,
    #[serde(default = "default_true")]
    pub liveness_pings: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_monitor: true,
            integrity: true,
            liveness_pings: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("PINFLEET"))
            .build()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        if config.cluster.nodes.is_empty() {
            return Err(FleetError::Config(
                "cluster.nodes must list at least one storage node".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn targets(&self) -> Vec<NodeTarget> {
        self.cluster.nodes.iter().map(NodeEntry::to_target).collect()
    }
}
