/// Health check endpoint
///
/// Reports 200 while the relay can reach its metadata database and is not
/// shutting down, 503 otherwise.
use crate::context::AppContext;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;

/// Health status response
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "ok" or "unavailable"
    pub status: String,

    /// Application version
    pub version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new().route("/xrpc/_health", get(health))
}

pub async fn health(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let version = ctx.relay.config().service.version.clone();
    match ctx.relay.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "ok".to_string(),
                version,
                message: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health_check_failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable".to_string(),
                    version,
                    message: Some(e.to_string()),
                }),
            )
        }
    }
}
