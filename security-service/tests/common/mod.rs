#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use secrecy::Secret;
use security_service::config::{
    AdminConfig, EncryptionConfig, Environment, JwtConfig, RateLimitConfig, RedisConfig,
    SecurityConfig, ServerConfig, ValidationConfig,
};
use security_service::services::{
    InMemoryStore, RateLimitStore, RevocationStore, StoreError, Subject, TokenType,
};
use security_service::{build_router, AppState};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const ADMIN_KEY: &str = "test-admin-key";
pub const MAX_BODY: usize = 1024;

/// A running app plus the temp directory holding its key store.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> SecurityConfig {
    SecurityConfig {
        environment: Environment::Dev,
        service_name: "security-service".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        server: ServerConfig::default(),
        redis: RedisConfig::default(),
        jwt: JwtConfig {
            secret: Some(Secret::new("integration-test-secret".to_string())),
            ..JwtConfig::default()
        },
        rate_limit: RateLimitConfig {
            requests: 100,
            period_seconds: 60,
            ..RateLimitConfig::default()
        },
        validation: ValidationConfig {
            max_body_size: MAX_BODY,
            ..ValidationConfig::default()
        },
        encryption: EncryptionConfig {
            master_key: Secret::new("integration-master-key".to_string()),
            key_store_path: dir.path().join("keys.json").to_string_lossy().into_owned(),
            auto_rotate_days: 90,
            kdf_iterations: 1_000,
        },
        admin: AdminConfig {
            api_key: Secret::new(ADMIN_KEY.to_string()),
        },
    }
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(|_| {})
}

pub fn spawn_app_with(customize: impl FnOnce(&mut SecurityConfig)) -> TestApp {
    spawn_app_on(Arc::new(InMemoryStore::new()), customize)
}

pub fn spawn_app_on<S>(store: Arc<S>, customize: impl FnOnce(&mut SecurityConfig)) -> TestApp
where
    S: RateLimitStore + RevocationStore + 'static,
{
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    customize(&mut config);

    let state = AppState::new(config, store).unwrap();
    TestApp {
        router: build_router(state.clone()),
        state,
        _dir: dir,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub fn access_token(&self, user: &str) -> String {
        let subject = Subject::new(user).with_roles(["user"]);
        self.state
            .tokens
            .issue(&subject, TokenType::Access, None)
            .unwrap()
    }

    pub fn refresh_token(&self, user: &str) -> String {
        self.state
            .tokens
            .issue(&Subject::new(user), TokenType::Refresh, None)
            .unwrap()
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// A store whose every call fails, standing in for a Redis outage.
pub struct UnavailableStore;

#[async_trait]
impl RateLimitStore for UnavailableStore {
    async fn record_hit(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl RevocationStore for UnavailableStore {
    async fn revoke(&self, _: &str, _: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn is_revoked(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}
