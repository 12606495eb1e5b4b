use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;

use crate::middleware::{AuthUser, BearerToken};
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
    /// Revoke the presented refresh token and issue a new one.
    #[serde(default)]
    pub rotate: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Exchange a refresh token for a new access token.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.tokens.refresh(&req.refresh_token, req.rotate).await?;
    Ok((StatusCode::OK, Json(outcome)))
}

/// Revoke the presented access token and, if supplied, a refresh token.
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    Extension(BearerToken(token)): Extension<BearerToken>,
    body: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    state.tokens.revoke(&token).await?;
    if let Some(refresh_token) = req.refresh_token.as_deref() {
        state.tokens.revoke(refresh_token).await?;
    }

    tracing::info!(sub = %user.0.sub, jti = %user.0.jti, "User logged out");

    Ok((
        StatusCode::OK,
        Json(json!({ "message": "Logged out successfully" })),
    ))
}

/// Claims of the authenticated caller.
pub async fn current_session(user: AuthUser) -> impl IntoResponse {
    let claims = user.0;
    Json(json!({
        "sub": claims.sub,
        "username": claims.username,
        "roles": claims.roles,
        "expires_at": claims.exp,
    }))
}
