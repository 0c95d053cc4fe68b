use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use domain::common::entity::Protocol;
use domain::conntrack::entity::StateId;
use domain::conntrack::snapshot::StateSnapshot;
use domain::conntrack::store::StateFilter;
use domain::srctrack::entity::{SourceNodeView, SrcNodeFilter};
use infrastructure::config::parse_cidr;
use serde::Deserialize;

use super::error::ApiError;
use super::state::AppState;

// ── Query params ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Body of a kill request. Every field narrows the selection; an empty
/// body kills every state.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KillRequest {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub proto: Option<Protocol>,
    pub interface: Option<String>,
    pub rdomain: Option<u16>,
}

impl KillRequest {
    fn to_filter(&self) -> Result<StateFilter, ApiError> {
        let net = |field: &'static str, value: &Option<String>| {
            value
                .as_deref()
                .map(parse_cidr)
                .transpose()
                .map_err(|e| ApiError::BadRequest {
                    code: "INVALID_ADDRESS",
                    message: format!("{field}: {e}"),
                })
        };
        Ok(StateFilter {
            src: net("src", &self.src)?,
            dst: net("dst", &self.dst)?,
            proto: self.proto,
            interface: self.interface.clone(),
            rdomain: self.rdomain,
            ..StateFilter::default()
        })
    }
}

// ── Handlers ──────────────────────────────────────────────────────

pub async fn list_states(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<StateSnapshot>> {
    Json(state.conntrack.list_states(query.limit))
}

pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path((creator, id)): Path<(u32, u64)>,
) -> Result<Json<StateSnapshot>, ApiError> {
    let snapshot = state.conntrack.get_state(&StateId { id, creator })?;
    Ok(Json(snapshot))
}

pub async fn kill_states(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KillRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = req.to_filter()?;
    let killed = state.conntrack.kill_states(&filter);
    tracing::info!(killed, "states killed via API");
    Ok((StatusCode::OK, Json(serde_json::json!({ "killed": killed }))))
}

pub async fn flush_states(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let flushed = state.conntrack.flush_states();
    tracing::info!(flushed, "state table flushed via API");
    (StatusCode::OK, Json(serde_json::json!({ "flushed": flushed })))
}

pub async fn list_src_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<SourceNodeView>> {
    Json(state.conntrack.list_src_nodes())
}

/// Forget every source node. States keep running.
pub async fn kill_src_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let killed = state.conntrack.kill_src_nodes(&SrcNodeFilter::default());
    tracing::info!(killed, "source nodes killed via API");
    (StatusCode::OK, Json(serde_json::json!({ "killed": killed })))
}
