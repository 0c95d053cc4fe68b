use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use domain::firewall::entity::RuleStats;
use infrastructure::config::parse_cidr;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;

// ── Response DTOs ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RuleResponse {
    /// Empty for the main ruleset.
    pub ruleset: String,
    pub nr: u32,
    pub label: Option<String>,
    pub action: &'static str,
    pub stats: RuleStats,
}

#[derive(Serialize)]
pub struct RulesetResponse {
    pub checksum: u64,
    pub rules: Vec<RuleResponse>,
}

#[derive(Debug, Serialize)]
pub struct TableResponse {
    pub name: String,
    /// CIDR strings; negated entries carry a leading `!`.
    pub entries: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableEntryRequest {
    pub address: String,
    #[serde(default)]
    pub negate: bool,
}

// ── Handlers ──────────────────────────────────────────────────────

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<RulesetResponse> {
    let rules = state
        .firewall
        .rule_reports()
        .into_iter()
        .map(|r| RuleResponse {
            ruleset: r.ruleset,
            nr: r.nr,
            label: r.label,
            action: r.action.as_str(),
            stats: r.stats,
        })
        .collect();
    Json(RulesetResponse {
        checksum: state.firewall.checksum(),
        rules,
    })
}

pub async fn list_tables(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.firewall.list_tables())
}

pub async fn get_table(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TableResponse>, ApiError> {
    let entries = state
        .firewall
        .table_entries(&name)
        .ok_or_else(|| ApiError::NotFound {
            code: "TABLE_NOT_FOUND",
            message: format!("table '{name}' not found"),
        })?;
    let entries = entries
        .iter()
        .map(|e| {
            if e.neg {
                format!("!{}", e.net)
            } else {
                e.net.to_string()
            }
        })
        .collect();
    Ok(Json(TableResponse { name, entries }))
}

pub async fn add_table_entry(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<TableEntryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let net = parse_entry(&req.address)?;
    let added = state.firewall.add_table_entry(&name, net, req.negate)?;
    tracing::info!(table = %name, address = %req.address, added, "table entry added via API");
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(serde_json::json!({ "added": added }))))
}

pub async fn delete_table_entry(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<TableEntryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let net = parse_entry(&req.address)?;
    let deleted = state.firewall.delete_table_entry(&name, net)?;
    tracing::info!(table = %name, address = %req.address, deleted, "table entry deleted via API");
    Ok((StatusCode::OK, Json(serde_json::json!({ "deleted": deleted }))))
}

fn parse_entry(address: &str) -> Result<domain::firewall::entity::IpNetwork, ApiError> {
    parse_cidr(address).map_err(|e| ApiError::BadRequest {
        code: "INVALID_ADDRESS",
        message: e.to_string(),
    })
}
