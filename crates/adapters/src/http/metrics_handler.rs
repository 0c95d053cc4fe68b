use std::sync::Arc;

use axum::extract::State;
use axum::http::header;

use super::error::ApiError;
use super::state::AppState;

/// Content-Type for `OpenMetrics` text exposition format.
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves Prometheus metrics in `OpenMetrics` text format.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
) -> Result<([(header::HeaderName, &'static str); 1], String), ApiError> {
    let body = state.metrics.encode().map_err(|e| ApiError::Internal {
        message: format!("metrics encoding failed: {e}"),
    })?;
    Ok(([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body))
}
