use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub status: String,
    pub nodes: usize,
    pub providers_online: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

fn default_event_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub(crate) struct MonitorStartRequest {
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ScheduleResponse {
    pub started: bool,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepairRequest {
    pub min_replicas: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LinkQuery {
    #[serde(default)]
    pub token: String,
}
