use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;

use crate::startup::AppState;
use crate::utils::constant_time_eq;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorized = request
        .headers()
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|key| constant_time_eq(state.config.admin.api_key.expose_secret(), key));

    if authorized {
        return Ok(next.run(request).await);
    }

    tracing::warn!(path = %request.uri().path(), "Failed admin authentication attempt");
    Err(AppError::Unauthorized(
        "Invalid or missing admin API key".to_string(),
    ))
}
