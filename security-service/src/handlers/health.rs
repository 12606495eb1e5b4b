use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::startup::AppState;

/// Liveness plus the shared store's status. The service keeps answering
/// while the store is down, so this reports `degraded` instead of failing.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.revocations.health_check().await {
        Ok(()) => "up",
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            "down"
        }
    };

    Json(json!({
        "status": if store == "up" { "healthy" } else { "degraded" },
        "service": state.config.service_name,
        "store": store,
    }))
}
