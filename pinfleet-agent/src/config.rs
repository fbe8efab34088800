use pinfleet_core::{FleetError, JobQueueConfig, ProviderConfig, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub jobs: JobQueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub provider_id: String,
    /// Identity of the local storage node in the content network.
    pub node_id: String,
    /// Bearer token presented to the backend at connect time.
    pub auth_token: String,
    /// WebSocket endpoint of the coordination backend.
    pub backend_url: String,
    /// RPC address of the local storage node.
    pub storage_node_addr: String,
    #[serde(default)]
    pub capacity_total_bytes: u64,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("PINFLEET_AGENT"))
            .build()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        if config.agent.auth_token.is_empty() {
            return Err(FleetError::Config(
                "agent.auth_token must not be empty".to_string(),
            ));
        }

        Ok(config)
    }
}
