mod common;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    routing::get,
    Json, Router,
};
use common::{body_json, get_with_token, spawn_app_with, TestApp, ADMIN_KEY};
use security_service::services::{Subject, TokenType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Serves the fixture JWKS and counts how often it is fetched.
async fn spawn_issuer() -> (SocketAddr, Arc<AtomicUsize>) {
    async fn jwks(State(hits): State<Arc<AtomicUsize>>) -> Json<serde_json::Value> {
        hits.fetch_add(1, Ordering::SeqCst);
        let document = include_str!("fixtures/jwks.json");
        Json(serde_json::from_str(document).unwrap())
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/.well-known/jwks.json", get(jwks))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, hits)
}

fn spawn_rs256_app(jwks_url: String) -> TestApp {
    spawn_app_with(|config| {
        config.jwt.algorithm = "RS256".to_string();
        config.jwt.secret = None;
        config.jwt.private_key_path = Some(format!("{}/rsa_private.pem", FIXTURES));
        config.jwt.key_id = Some("test-key-1".to_string());
        config.jwt.jwks_url = Some(jwks_url);
    })
}

fn invalidate_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/admin/jwks/invalidate")
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn rs256_tokens_verify_against_remote_jwks() {
    let (addr, hits) = spawn_issuer().await;
    let app = spawn_rs256_app(format!("http://{}/.well-known/jwks.json", addr));
    let token = app.access_token("user-1");

    for _ in 0..3 {
        let response = app.send(get_with_token("/auth/session", &token)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let response = app.send(invalidate_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["invalidated"], true);

    let response = app.send(get_with_token("/auth/session", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn token_signed_by_unpublished_key_is_rejected() {
    let (addr, _) = spawn_issuer().await;
    let app = spawn_rs256_app(format!("http://{}/.well-known/jwks.json", addr));

    let foreign = spawn_app_with(|config| {
        config.jwt.algorithm = "RS256".to_string();
        config.jwt.private_key_path = Some(format!("{}/rsa_private.pem", FIXTURES));
        config.jwt.public_key_path = Some(format!("{}/rsa_public.pem", FIXTURES));
        config.jwt.key_id = Some("retired-key".to_string());
    });
    let token = foreign
        .state
        .tokens
        .issue(&Subject::new("user-1"), TokenType::Access, None)
        .unwrap();

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
}

#[tokio::test]
async fn unreachable_jwks_is_service_unavailable() {
    // Bind then drop a listener so the port refuses connections.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let app = spawn_rs256_app(format!("http://{}/.well-known/jwks.json", addr));
    let token = app.access_token("user-1");

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
