//! Backend-side registry of connected providers: credential checks,
//! heartbeat-derived liveness, and routing of new storage work.

use crate::config::ProviderConfig;
use crate::error::{FleetError, Result};
use crate::persistence::{record_schema_version, FleetStore};
use crate::protocol::{
    CapacityPayload, Heartbeat, RegisterPayload, StorageJobPayload, WelcomePayload, WireMessage,
    CLOSE_POLICY_VIOLATION,
};
use crate::router::ClusterRequestRouter;
use crate::storage::StorageNodeClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Backend end of one provider link; implemented by the transport layer.
#[async_trait]
pub trait ProviderSink: Send + Sync {
    async fn send(&self, message: WireMessage) -> Result<()>;
    async fn close(&self, code: u16, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Online,
    Offline,
}

struct ProviderConnection {
    node_id: String,
    sink: Arc<dyn ProviderSink>,
    connected_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    status: ProviderStatus,
    capacity: Option<CapacityPayload>,
    awaiting_pong: bool,
    ping_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub provider_id: String,
    pub node_id: String,
    pub online: bool,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub capacity: Option<CapacityPayload>,
}

/// Contract row read from the key-value persistence capability; written
/// by the (out-of-scope) contract CRUD layer under `contract:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRecord {
    #[serde(default = "record_schema_version")]
    pub schema_version: u32,
    pub contract_id: String,
    pub provider_id: String,
    pub cid: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutedWork {
    /// Dispatched over the assigned provider's live link.
    Direct { provider_id: String },
    /// Provider unavailable; pinned onto the fallback cluster instead.
    Fallback { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PingRoundReport {
    pub pinged: usize,
    pub terminated: Vec<String>,
}

/// Tracks one [`ProviderConnection`] per connected provider and answers
/// liveness queries per the heartbeat-staleness invariant.
pub struct ProviderRegistry {
    config: ProviderConfig,
    auth_tokens: HashSet<String>,
    store: Arc<dyn FleetStore>,
    router: Arc<ClusterRequestRouter>,
    client: Arc<dyn StorageNodeClient>,
    providers: RwLock<HashMap<String, ProviderConnection>>,
}

impl ProviderRegistry {
    pub fn new(
        auth_tokens: Vec<String>,
        store: Arc<dyn FleetStore>,
        router: Arc<ClusterRequestRouter>,
        client: Arc<dyn StorageNodeClient>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            config,
            auth_tokens: auth_tokens.into_iter().collect(),
            store,
            router,
            client,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Bearer-token check performed at connect time; a failed check closes
    /// the socket with a policy violation code before any registration.
    pub fn authorize(&self, token: &str) -> bool {
        !token.is_empty() && self.auth_tokens.contains(token)
    }

    /// Accept a provider's `register` message and start tracking its link.
    /// A re-register replaces any previous connection for the provider.
    pub async fn register(
        &self,
        payload: RegisterPayload,
        sink: Arc<dyn ProviderSink>,
    ) -> Result<WelcomePayload> {
        if payload.node_id.is_empty() {
            return Err(FleetError::Protocol(
                "registration without a node identity".to_string(),
            ));
        }

        let now = Utc::now();
        let connection = ProviderConnection {
            node_id: payload.node_id.clone(),
            sink,
            connected_at: now,
            last_heartbeat_at: now,
            status: ProviderStatus::Online,
            capacity: payload.capacity.clone(),
            awaiting_pong: false,
            ping_seq: 0,
        };

        let mut providers = self.providers.write().await;
        if providers
            .insert(payload.provider_id.clone(), connection)
            .is_some()
        {
            tracing::info!(
                "Provider {} re-registered, replacing previous link",
                payload.provider_id
            );
        } else {
            tracing::info!("Provider {} registered", payload.provider_id);
        }

        Ok(WelcomePayload {
            provider_id: payload.provider_id,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
        })
    }

    /// Record a heartbeat (ping or pong) from the provider.
    pub async fn heartbeat(&self, provider_id: &str) {
        let mut providers = self.providers.write().await;
        if let Some(connection) = providers.get_mut(provider_id) {
            connection.last_heartbeat_at = Utc::now();
            connection.awaiting_pong = false;
        }
    }

    pub async fn capacity_update(&self, provider_id: &str, capacity: CapacityPayload) {
        let mut providers = self.providers.write().await;
        if let Some(connection) = providers.get_mut(provider_id) {
            connection.capacity = Some(capacity);
        }
    }

    /// Flip the provider offline immediately, without waiting for the
    /// heartbeat window to lapse (`going_offline`, missed pong).
    pub async fn mark_offline(&self, provider_id: &str) {
        let mut providers = self.providers.write().await;
        if let Some(connection) = providers.get_mut(provider_id) {
            connection.status = ProviderStatus::Offline;
        }
    }

    /// Drop the connection record entirely; called when the link closes.
    pub async fn unregister(&self, provider_id: &str) {
        if self.providers.write().await.remove(provider_id).is_some() {
            tracing::info!("Provider {} link closed", provider_id);
        }
    }

    /// A provider is online iff it is registered, its last reported status
    /// is not offline, and its heartbeat is younger than the staleness
    /// window.
    pub async fn is_online(&self, provider_id: &str) -> bool {
        let providers = self.providers.read().await;
        let Some(connection) = providers.get(provider_id) else {
            return false;
        };

        connection.status == ProviderStatus::Online
            && Utc::now() - connection.last_heartbeat_at < self.config.heartbeat_staleness()
    }

    pub async fn providers(&self) -> Vec<ProviderSummary> {
        let staleness = self.config.heartbeat_staleness();
        let now = Utc::now();
        let providers = self.providers.read().await;

        let mut summaries: Vec<ProviderSummary> = providers
            .iter()
            .map(|(provider_id, connection)| ProviderSummary {
                provider_id: provider_id.clone(),
                node_id: connection.node_id.clone(),
                online: connection.status == ProviderStatus::Online
                    && now - connection.last_heartbeat_at < staleness,
                connected_at: connection.connected_at,
                last_heartbeat_at: connection.last_heartbeat_at,
                capacity: connection.capacity.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        summaries
    }

    pub async fn send_to(&self, provider_id: &str, message: WireMessage) -> Result<()> {
        let sink = {
            let providers = self.providers.read().await;
            providers
                .get(provider_id)
                .map(|connection| connection.sink.clone())
                .ok_or_else(|| FleetError::ProviderOffline(provider_id.to_string()))?
        };
        sink.send(message).await
    }

    /// Dispatch the contract's storage job to its assigned provider, or
    /// fall back to the general cluster when the provider is unavailable.
    pub async fn route_new_work(&self, contract_id: &str) -> Result<RoutedWork> {
        let record = self.resolve_contract(contract_id)?;

        if self.is_online(&record.provider_id).await {
            let job = WireMessage::StorageJob(StorageJobPayload {
                contract_id: record.contract_id.clone(),
                cid: record.cid.clone(),
                size_bytes: None,
            });
            match self.send_to(&record.provider_id, job).await {
                Ok(()) => {
                    tracing::info!(
                        "Contract {} dispatched directly to provider {}",
                        contract_id,
                        record.provider_id
                    );
                    return Ok(RoutedWork::Direct {
                        provider_id: record.provider_id,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        "Direct dispatch of contract {} to {} failed: {}",
                        contract_id,
                        record.provider_id,
                        error
                    );
                }
            }
        }

        let reason = self.offline_reason(&record.provider_id).await;
        tracing::info!(
            "Contract {} routed to fallback cluster: {}",
            contract_id,
            reason
        );

        let client = self.client.clone();
        let cid = record.cid.clone();
        self.router
            .execute(move |node| {
                let client = client.clone();
                let cid = cid.clone();
                async move { client.pin(&node.address, &cid).await }
            })
            .await?;

        Ok(RoutedWork::Fallback { reason })
    }

    /// Backend-initiated liveness round: terminate links that missed the
    /// previous pong, ping everyone else.
    pub async fn ping_round(&self) -> PingRoundReport {
        struct Planned {
            provider_id: String,
            sink: Arc<dyn ProviderSink>,
            terminate: bool,
            seq: u64,
        }

        let planned: Vec<Planned> = {
            let mut providers = self.providers.write().await;
            providers
                .iter_mut()
                .filter(|(_, connection)| connection.status == ProviderStatus::Online)
                .map(|(provider_id, connection)| {
                    let terminate = connection.awaiting_pong;
                    if !terminate {
                        connection.awaiting_pong = true;
                        connection.ping_seq += 1;
                    }
                    Planned {
                        provider_id: provider_id.clone(),
                        sink: connection.sink.clone(),
                        terminate,
                        seq: connection.ping_seq,
                    }
                })
                .collect()
        };

        let mut pinged = 0usize;
        let mut terminated = Vec::new();

        for plan in planned {
            if plan.terminate {
                tracing::warn!(
                    "Provider {} missed a liveness pong, terminating link",
                    plan.provider_id
                );
                if let Err(error) = plan
                    .sink
                    .close(CLOSE_POLICY_VIOLATION, "missed liveness pong")
                    .await
                {
                    tracing::debug!(
                        "Close of silent link {} failed: {}",
                        plan.provider_id,
                        error
                    );
                }
                self.mark_offline(&plan.provider_id).await;
                terminated.push(plan.provider_id);
            } else {
                let ping = WireMessage::Ping(Heartbeat { seq: plan.seq });
                if let Err(error) = plan.sink.send(ping).await {
                    tracing::warn!("Ping to provider {} failed: {}", plan.provider_id, error);
                } else {
                    pinged += 1;
                }
            }
        }

        PingRoundReport { pinged, terminated }
    }

    fn resolve_contract(&self, contract_id: &str) -> Result<ContractRecord> {
        let value = self
            .store
            .load_state(&format!("contract:{}", contract_id))?
            .ok_or_else(|| {
                FleetError::InvalidRequest(format!("unknown contract: {}", contract_id))
            })?;
        Ok(serde_json::from_value(value)?)
    }

    async fn offline_reason(&self, provider_id: &str) -> String {
        let providers = self.providers.read().await;
        match providers.get(provider_id) {
            None => format!("provider {} has no registered link", provider_id),
            Some(connection) if connection.status == ProviderStatus::Offline => {
                format!("provider {} reported offline", provider_id)
            }
            Some(connection) => {
                let age = (Utc::now() - connection.last_heartbeat_at).num_seconds();
                format!(
                    "provider {} heartbeat is {}s old (window {}s)",
                    provider_id, age, self.config.heartbeat_staleness_secs
                )
            }
        }
    }

    #[cfg(test)]
    async fn age_heartbeat(&self, provider_id: &str, seconds: i64) {
        let mut providers = self.providers.write().await;
        if let Some(connection) = providers.get_mut(provider_id) {
            connection.last_heartbeat_at = Utc::now() - chrono::Duration::seconds(seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::node::NodeTarget;
    use crate::probe::HealthProbe;
    use crate::testutil::MemoryStore;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct SinkSim {
        sent: StdMutex<Vec<WireMessage>>,
        closed: StdMutex<Option<(u16, String)>>,
    }

    #[async_trait]
    impl ProviderSink for SinkSim {
        async fn send(&self, message: WireMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&self, code: u16, reason: &str) -> Result<()> {
            *self.closed.lock().unwrap() = Some((code, reason.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FallbackSim {
        pins: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StorageNodeClient for FallbackSim {
        async fn health_check(&self, _address: &str) -> Result<bool> {
            Ok(true)
        }

        async fn list_pins(&self, _address: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn pin(&self, address: &str, cid: &str) -> Result<()> {
            self.pins
                .lock()
                .unwrap()
                .push((address.to_string(), cid.to_string()));
            Ok(())
        }

        async fn unpin(&self, _address: &str, _cid: &str) -> Result<()> {
            Ok(())
        }

        async fn fetch_presence(&self, _address: &str, _cid: &str) -> Result<bool> {
            Ok(true)
        }

        async fn add_content(&self, _address: &str, _data: Bytes) -> Result<String> {
            Ok("bafy-new".to_string())
        }
    }

    fn registry_with(
        store: Arc<MemoryStore>,
        client: Arc<FallbackSim>,
    ) -> ProviderRegistry {
        let targets = vec![NodeTarget {
            node_id: "cluster-1".to_string(),
            address: "10.0.1.1:5001".to_string(),
        }];
        let probe = HealthProbe::new(client.clone(), Duration::from_millis(100));
        let router = Arc::new(ClusterRequestRouter::new(
            probe,
            targets,
            RouterConfig {
                max_retries: 1,
                ..RouterConfig::default()
            },
        ));
        ProviderRegistry::new(
            vec!["secret-token".to_string()],
            store,
            router,
            client,
            ProviderConfig::default(),
        )
    }

    fn register_payload(provider_id: &str) -> RegisterPayload {
        RegisterPayload {
            provider_id: provider_id.to_string(),
            node_id: format!("{}-node", provider_id),
            capacity: None,
        }
    }

    fn seed_contract(store: &MemoryStore, contract_id: &str, provider_id: &str, cid: &str) {
        let record = ContractRecord {
            schema_version: record_schema_version(),
            contract_id: contract_id.to_string(),
            provider_id: provider_id.to_string(),
            cid: cid.to_string(),
        };
        store
            .save_state(
                &format!("contract:{}", contract_id),
                &serde_json::to_value(&record).unwrap(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_authorize_checks_token_set() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        assert!(registry.authorize("secret-token"));
        assert!(!registry.authorize("wrong"));
        assert!(!registry.authorize(""));
    }

    #[tokio::test]
    async fn test_stale_heartbeat_reports_offline_without_explicit_signal() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        registry
            .register(register_payload("p-1"), Arc::new(SinkSim::default()))
            .await
            .unwrap();
        assert!(registry.is_online("p-1").await);

        registry.age_heartbeat("p-1", 61).await;
        assert!(!registry.is_online("p-1").await);

        // A fresh heartbeat brings it back.
        registry.heartbeat("p-1").await;
        assert!(registry.is_online("p-1").await);
    }

    #[tokio::test]
    async fn test_going_offline_is_immediate() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        registry
            .register(register_payload("p-1"), Arc::new(SinkSim::default()))
            .await
            .unwrap();
        registry.mark_offline("p-1").await;

        assert!(!registry.is_online("p-1").await);
    }

    #[tokio::test]
    async fn test_register_requires_node_identity() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        let payload = RegisterPayload {
            provider_id: "p-1".to_string(),
            node_id: String::new(),
            capacity: None,
        };
        assert!(matches!(
            registry.register(payload, Arc::new(SinkSim::default())).await,
            Err(FleetError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_route_dispatches_directly_to_online_provider() {
        let store = Arc::new(MemoryStore::default());
        let client = Arc::new(FallbackSim::default());
        let registry = registry_with(store.clone(), client.clone());

        seed_contract(&store, "c-1", "p-1", "bafy-1");
        let sink = Arc::new(SinkSim::default());
        registry
            .register(register_payload("p-1"), sink.clone())
            .await
            .unwrap();

        let routed = registry.route_new_work("c-1").await.unwrap();
        assert!(matches!(routed, RoutedWork::Direct { ref provider_id } if provider_id == "p-1"));

        let sent = sink.sent.lock().unwrap();
        assert!(matches!(
            sent.first(),
            Some(WireMessage::StorageJob(job)) if job.cid == "bafy-1"
        ));
        assert!(client.pins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_falls_back_when_provider_offline() {
        let store = Arc::new(MemoryStore::default());
        let client = Arc::new(FallbackSim::default());
        let registry = registry_with(store.clone(), client.clone());

        seed_contract(&store, "c-1", "p-ghost", "bafy-1");

        let routed = registry.route_new_work("c-1").await.unwrap();
        match routed {
            RoutedWork::Fallback { reason } => {
                assert!(reason.contains("p-ghost"));
            }
            other => panic!("expected fallback, got {:?}", other),
        }

        let pins = client.pins.lock().unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].1, "bafy-1");
    }

    #[tokio::test]
    async fn test_route_unknown_contract_is_an_error() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        assert!(matches!(
            registry.route_new_work("c-missing").await,
            Err(FleetError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_round_terminates_links_missing_pong() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        let sink = Arc::new(SinkSim::default());
        registry
            .register(register_payload("p-1"), sink.clone())
            .await
            .unwrap();

        let first = registry.ping_round().await;
        assert_eq!(first.pinged, 1);
        assert!(first.terminated.is_empty());
        assert!(matches!(
            sink.sent.lock().unwrap().first(),
            Some(WireMessage::Ping(_))
        ));

        // No pong arrives: the next round terminates the link.
        let second = registry.ping_round().await;
        assert_eq!(second.terminated, vec!["p-1".to_string()]);
        assert_eq!(
            sink.closed.lock().unwrap().as_ref().unwrap().0,
            CLOSE_POLICY_VIOLATION
        );
        assert!(!registry.is_online("p-1").await);

        // A pong in between keeps the link alive instead.
        let sink2 = Arc::new(SinkSim::default());
        registry
            .register(register_payload("p-2"), sink2.clone())
            .await
            .unwrap();
        registry.ping_round().await;
        registry.heartbeat("p-2").await;
        let third = registry.ping_round().await;
        assert!(third.terminated.is_empty());
        assert!(registry.is_online("p-2").await);
    }

    #[tokio::test]
    async fn test_unregister_destroys_connection_record() {
        let registry = registry_with(
            Arc::new(MemoryStore::default()),
            Arc::new(FallbackSim::default()),
        );

        registry
            .register(register_payload("p-1"), Arc::new(SinkSim::default()))
            .await
            .unwrap();
        registry.unregister("p-1").await;

        assert!(!registry.is_online("p-1").await);
        assert!(registry.providers().await.is_empty());
    }
}
