use crate::config::Config;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pinfleet_core::{
    ClusterRequestRouter, FailoverManager, FleetStore, HealthProbe, HttpStorageNodeClient,
    IntegrityVerifier, ProviderRegistry, Result, SqliteFleetStore, StorageNodeClient,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::interval;

mod control;
mod types;
mod ws;

use control::{
    contract_dispatch, fleet_events, fleet_nodes, fleet_recover, fleet_sweep, health,
    integrity_audit, integrity_repair, integrity_report, integrity_schedules_start,
    integrity_schedules_stop, integrity_verify, monitor_start, monitor_stop, providers_list,
};
pub(crate) use types::*;

/// One named periodic loop with start/stop control. A started task runs
/// `tick` to completion on every interval; the core operations it calls
/// carry their own skip-if-running guards.
pub(crate) struct PeriodicTask {
    name: &'static str,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn start<F, Fut>(&self, every: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }

        let name = self.name;
        tracing::info!("Starting {} schedule every {:?}", name, every);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tick().await;
            }
        }));
        true
    }

    pub(crate) fn stop(&self) -> bool {
        match self.slot.lock().unwrap().take() {
            Some(task) => {
                task.abort();
                tracing::info!("Stopped {} schedule", self.name);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

pub(crate) struct Schedules {
    pub(crate) health: PeriodicTask,
    pub(crate) audit: PeriodicTask,
    pub(crate) monitor: PeriodicTask,
    pub(crate) liveness: PeriodicTask,
}

impl Schedules {
    fn new() -> Self {
        Self {
            health: PeriodicTask::new("health-sweep"),
            audit: PeriodicTask::new("redundancy-audit"),
            monitor: PeriodicTask::new("replication-monitor"),
            liveness: PeriodicTask::new("provider-liveness"),
        }
    }
}

pub struct ServerState {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn FleetStore>,
    pub(crate) failover: Arc<FailoverManager>,
    pub(crate) integrity: Arc<IntegrityVerifier>,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) schedules: Schedules,
}

pub async fn run_server(config: Config) -> Result<()> {
    let store: Arc<dyn FleetStore> =
        Arc::new(SqliteFleetStore::new(config.server.db_path.clone())?);

    let client: Arc<dyn StorageNodeClient> = Arc::new(HttpStorageNodeClient::new(
        config.fleet.router.per_attempt_timeout(),
    ));

    let targets = config.targets();
    let probe = HealthProbe::new(client.clone(), config.fleet.health.probe_timeout());
    let router = Arc::new(ClusterRequestRouter::new(
        probe,
        targets.clone(),
        config.fleet.router.clone(),
    ));

    let failover = Arc::new(FailoverManager::new(
        targets.clone(),
        client.clone(),
        store.clone(),
        config.fleet.health.clone(),
    ));
    let integrity = Arc::new(IntegrityVerifier::new(
        client.clone(),
        router.clone(),
        store.clone(),
        targets,
        config.fleet.integrity.clone(),
    ));
    let registry = Arc::new(ProviderRegistry::new(
        config.auth.provider_tokens.clone(),
        store.clone(),
        router,
        client,
        config.fleet.provider.clone(),
    ));

    let state = Arc::new(ServerState {
        config,
        store,
        failover,
        integrity,
        registry,
        schedules: Schedules::new(),
    });

    if state.config.schedules.health_monitor {
        start_health_monitor(&state, state.config.fleet.health.sweep_interval());
    }
    if state.config.schedules.integrity {
        start_integrity_schedules(&state);
    }
    if state.config.schedules.liveness_pings {
        start_liveness_pings(&state);
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/fleet/nodes", get(fleet_nodes))
        .route("/api/v1/fleet/sweep", post(fleet_sweep))
        .route("/api/v1/fleet/nodes/:node_id/recover", post(fleet_recover))
        .route("/api/v1/fleet/events", get(fleet_events))
        .route("/api/v1/fleet/monitor/start", post(monitor_start))
        .route("/api/v1/fleet/monitor/stop", post(monitor_stop))
        .route("/api/v1/integrity/report", get(integrity_report))
        .route("/api/v1/integrity/audit", post(integrity_audit))
        .route("/api/v1/integrity/verify/:cid", post(integrity_verify))
        .route("/api/v1/integrity/repair/:cid", post(integrity_repair))
        .route(
            "/api/v1/integrity/schedules/start",
            post(integrity_schedules_start),
        )
        .route(
            "/api/v1/integrity/schedules/stop",
            post(integrity_schedules_stop),
        )
        .route("/api/v1/providers", get(providers_list))
        .route(
            "/api/v1/contracts/:contract_id/dispatch",
            post(contract_dispatch),
        )
        .route("/api/v1/providers/link", get(ws::provider_link))
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.bind_addr).await?;
    tracing::info!("Pinfleet server listening on {}", state.config.server.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| pinfleet_core::FleetError::Http(error.to_string()))?;

    Ok(())
}

pub(crate) fn start_health_monitor(state: &Arc<ServerState>, every: Duration) -> bool {
    let failover = state.failover.clone();
    state.schedules.health.start(every, move || {
        let failover = failover.clone();
        async move {
            if let Err(error) = failover.sweep().await {
                tracing::warn!("Scheduled health sweep failed: {}", error);
            }
        }
    })
}

pub(crate) fn start_integrity_schedules(state: &Arc<ServerState>) -> bool {
    let integrity_config = state.integrity.config().clone();

    let audit_target = state.integrity.clone();
    let audit_started = state
        .schedules
        .audit
        .start(integrity_config.audit_interval(), move || {
            let integrity = audit_target.clone();
            async move {
                if let Err(error) = integrity.audit_redundancy().await {
                    tracing::warn!("Scheduled redundancy audit failed: {}", error);
                }
            }
        });

    let monitor_target = state.integrity.clone();
    let min_replicas = integrity_config.min_replicas;
    let monitor_started =
        state
            .schedules
            .monitor
            .start(integrity_config.monitor_interval(), move || {
                let integrity = monitor_target.clone();
                async move {
                    if let Err(error) = integrity.monitor_replication_factor(min_replicas).await {
                        tracing::warn!("Scheduled replication monitor failed: {}", error);
                    }
                }
            });

    audit_started && monitor_started
}

pub(crate) fn start_liveness_pings(state: &Arc<ServerState>) -> bool {
    let registry = state.registry.clone();
    state.schedules.liveness.start(
        state.config.fleet.provider.heartbeat_interval(),
        move || {
            let registry = registry.clone();
            async move {
                let report = registry.ping_round().await;
                if !report.terminated.is_empty() {
                    tracing::warn!(
                        "Liveness round terminated silent providers: {:?}",
                        report.terminated
                    );
                }
            }
        },
    )
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}
