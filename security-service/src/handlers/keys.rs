use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

use crate::services::CryptoError;
use crate::startup::AppState;

/// Rotate the data-encryption key. If another instance rotated at the same
/// time, its key is adopted and reported instead.
pub async fn rotate_key(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let keys = state.encryptor.key_manager().clone();

    let result = tokio::task::spawn_blocking(move || match keys.rotate() {
        Ok(key_id) => Ok((key_id, true)),
        Err(CryptoError::RotationConflict { .. }) => keys.current_key_id().map(|id| (id, false)),
        Err(e) => Err(e),
    })
    .await
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Rotation task failed: {}", e)))?;

    let (key_id, rotated) = result?;

    Ok(Json(json!({
        "current_key_id": key_id,
        "rotated": rotated,
    })))
}

/// Key metadata; never key material.
pub async fn list_keys(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let keys = state.encryptor.key_manager().keys()?;
    Ok(Json(json!({ "keys": keys })))
}

/// Drop cached JWKS keys so the next verification refetches them.
pub async fn invalidate_jwks(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let source = state
        .tokens
        .jwks()
        .ok_or_else(|| AppError::NotFound("No JWKS source configured".to_string()))?;

    source.invalidate().await;
    Ok(Json(json!({ "invalidated": true })))
}
