//! Operational control surface: thin handlers translating HTTP calls into
//! core operations.

use super::{
    response_error, start_health_monitor, start_integrity_schedules, EventsQuery, HealthResponse,
    MonitorStartRequest, RepairRequest, ScheduleResponse, ServerState, StopResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pinfleet_core::FleetStore;
use std::sync::Arc;
use std::time::Duration;

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let providers = state.registry.providers().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        nodes: state.config.cluster.nodes.len(),
        providers_online: providers.iter().filter(|provider| provider.online).count(),
    })
}

pub(crate) async fn fleet_nodes(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.failover.nodes().await)
}

pub(crate) async fn fleet_sweep(State(state): State<Arc<ServerState>>) -> Response {
    match state.failover.sweep().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

pub(crate) async fn fleet_recover(
    State(state): State<Arc<ServerState>>,
    Path(node_id): Path<String>,
) -> Response {
    match state.failover.recover(&node_id).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(error) => response_error(StatusCode::NOT_FOUND, error.to_string()),
    }
}

pub(crate) async fn fleet_events(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state.store.recent_events(query.limit) {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(error) => response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

pub(crate) async fn monitor_start(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<MonitorStartRequest>>,
) -> Response {
    let every = body
        .and_then(|Json(request)| request.interval_secs)
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.fleet.health.sweep_interval());

    let started = start_health_monitor(&state, every);
    (
        StatusCode::OK,
        Json(ScheduleResponse {
            started,
            running: state.schedules.health.is_running(),
        }),
    )
        .into_response()
}

pub(crate) async fn monitor_stop(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(StopResponse {
        stopped: state.schedules.health.stop(),
    })
}

pub(crate) async fn integrity_report(State(state): State<Arc<ServerState>>) -> Response {
    match state.integrity.current_report().await {
        Some(report) => (StatusCode::OK, Json(report)).into_response(),
        None => response_error(StatusCode::NOT_FOUND, "no redundancy audit has run yet"),
    }
}

pub(crate) async fn integrity_audit(State(state): State<Arc<ServerState>>) -> Response {
    match state.integrity.audit_redundancy().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => response_error(StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
    }
}

pub(crate) async fn integrity_verify(
    State(state): State<Arc<ServerState>>,
    Path(cid): Path<String>,
) -> Response {
    match state.integrity.verify_por(&cid).await {
        Ok(audit) => (StatusCode::OK, Json(audit)).into_response(),
        Err(error) => response_error(StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
    }
}

pub(crate) async fn integrity_repair(
    State(state): State<Arc<ServerState>>,
    Path(cid): Path<String>,
    body: Option<Json<RepairRequest>>,
) -> Response {
    let min_replicas = body
        .and_then(|Json(request)| request.min_replicas)
        .unwrap_or(state.integrity.config().min_replicas);

    match state.integrity.auto_repair(&cid, min_replicas).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(error) => response_error(StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
    }
}

pub(crate) async fn integrity_schedules_start(
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let started = start_integrity_schedules(&state);
    Json(ScheduleResponse {
        started,
        running: state.schedules.audit.is_running() && state.schedules.monitor.is_running(),
    })
}

pub(crate) async fn integrity_schedules_stop(
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let audit_stopped = state.schedules.audit.stop();
    let monitor_stopped = state.schedules.monitor.stop();
    Json(StopResponse {
        stopped: audit_stopped || monitor_stopped,
    })
}

pub(crate) async fn providers_list(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.registry.providers().await)
}

pub(crate) async fn contract_dispatch(
    State(state): State<Arc<ServerState>>,
    Path(contract_id): Path<String>,
) -> Response {
    match state.registry.route_new_work(&contract_id).await {
        Ok(routed) => (StatusCode::OK, Json(routed)).into_response(),
        Err(pinfleet_core::FleetError::InvalidRequest(message)) => {
            response_error(StatusCode::NOT_FOUND, message)
        }
        Err(error) => response_error(StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
    }
}
