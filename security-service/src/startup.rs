use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use service_core::middleware::{
    metrics::metrics_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::SecurityConfig;
use crate::handlers;
use crate::middleware::{
    admin_auth_middleware, security_pipeline_middleware, AuthStage, RateLimitStage, RoleStage,
    SecurityPipeline, ValidationStage,
};
use crate::services::{
    Encryptor, InputValidator, KeyManager, RateLimitStore, RateLimiter, RevocationStore,
    TokenService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SecurityConfig>,
    pub tokens: Arc<TokenService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub validator: Arc<InputValidator>,
    pub encryptor: Arc<Encryptor>,
    pub revocations: Arc<dyn RevocationStore>,
    pub pipeline: Arc<SecurityPipeline>,
}

impl AppState {
    /// Wire every component from `config` over one shared store.
    pub fn new<S>(config: SecurityConfig, store: Arc<S>) -> Result<Self, anyhow::Error>
    where
        S: RateLimitStore + RevocationStore + 'static,
    {
        let revocations: Arc<dyn RevocationStore> = store.clone();
        let counters: Arc<dyn RateLimitStore> = store;

        let tokens = Arc::new(TokenService::new(&config.jwt, revocations.clone())?);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), counters));
        let validator = Arc::new(InputValidator::new(&config.validation)?);

        let keys = KeyManager::open(&config.encryption)
            .map_err(|e| anyhow::anyhow!("Failed to open key store: {}", e))?;
        let encryptor = Arc::new(Encryptor::new(Arc::new(keys)));

        let pipeline = SecurityPipeline::new()
            .with_stage(Arc::new(ValidationStage::new(validator.clone())))
            .with_stage(Arc::new(RateLimitStage::new(rate_limiter.clone())))
            .with_stage(Arc::new(AuthStage::new(tokens.clone(), &config.jwt)))
            .with_stage(Arc::new(RoleStage::new(&config.jwt.required_roles)));
        tracing::info!(stages = ?pipeline.stage_names(), "Security pipeline assembled");

        Ok(Self {
            config: Arc::new(config),
            tokens,
            rate_limiter,
            validator,
            encryptor,
            revocations,
            pipeline: Arc::new(pipeline),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/keys", get(handlers::keys::list_keys))
        .route("/admin/keys/rotate", post(handlers::keys::rotate_key))
        .route("/admin/jwks/invalidate", post(handlers::keys::invalidate_jwks))
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/auth/refresh", post(handlers::session::refresh))
        .route("/auth/logout", post(handlers::session::logout))
        .route("/auth/session", get(handlers::session::current_session))
        .merge(admin_routes)
        .route_layer(from_fn(metrics_middleware))
        .with_state(state.clone())
        // Stages run in registration order
        .layer(from_fn_with_state(
            state.pipeline.clone(),
            security_pipeline_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
}
