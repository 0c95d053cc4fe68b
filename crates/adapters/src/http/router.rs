use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use super::conntrack_handler::{
    flush_states, get_state, kill_src_nodes, kill_states, list_src_nodes, list_states,
};
use super::firewall_handler::{
    add_table_entry, delete_table_entry, get_table, list_rules, list_tables,
};
use super::health_handler::{agent_status, healthz};
use super::metrics_handler::metrics;
use super::state::AppState;

/// Build the router serving probes, metrics and the management API.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));

    let api_routes = Router::new()
        .route("/api/v1/status", get(agent_status))
        .route("/api/v1/rules", get(list_rules))
        .route("/api/v1/tables", get(list_tables))
        .route(
            "/api/v1/tables/{name}",
            get(get_table).post(add_table_entry).delete(delete_table_entry),
        )
        .route("/api/v1/states", get(list_states).delete(flush_states))
        .route("/api/v1/states/kill", post(kill_states))
        .route("/api/v1/states/{creator}/{id}", get(get_state))
        .route("/api/v1/src-nodes", get(list_src_nodes))
        .route("/api/v1/src-nodes/all", delete(kill_src_nodes));

    public_routes.merge(api_routes).with_state(state)
}
