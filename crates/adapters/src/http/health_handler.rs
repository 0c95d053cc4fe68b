use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use application::firewall_engine::EngineStatus;
use serde::Serialize;

use super::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct AgentStatusResponse {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub engine: EngineStatus,
}

/// Liveness probe. Always 200 while the process runs.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn agent_status(State(state): State<Arc<AppState>>) -> Json<AgentStatusResponse> {
    Json(AgentStatusResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        engine: state.conntrack.status(),
    })
}
