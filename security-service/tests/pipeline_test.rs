mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{
    body_json, get, get_with_token, post_json, spawn_app, spawn_app_with, ADMIN_KEY, MAX_BODY,
};
use security_service::config::ValidationMode;

fn padded_body(total_len: usize) -> String {
    // `{"pad":""}` is 10 bytes
    let body = format!(r#"{{"pad":"{}"}}"#, "a".repeat(total_len - 10));
    assert_eq!(body.len(), total_len);
    body
}

#[tokio::test]
async fn health_is_public_and_unlimited() {
    let app = spawn_app();

    let response = app.send(get("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
    assert!(response.headers().get("x-request-id").is_some());
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "up");
}

#[tokio::test]
async fn protected_route_requires_credential() {
    let app = spawn_app();

    let response = app.send(get("/auth/session")).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Authorization header is missing");
}

#[tokio::test]
async fn valid_access_token_reaches_handler() {
    let app = spawn_app();
    let token = app.access_token("user-1");

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "100");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "99");

    let body = body_json(response).await;
    assert_eq!(body["sub"], "user-1");
    assert_eq!(body["roles"][0], "user");
}

#[tokio::test]
async fn refresh_token_is_not_a_bearer_credential() {
    let app = spawn_app();
    let token = app.refresh_token("user-1");

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Could not validate credentials.");
}

#[tokio::test]
async fn tampered_token_rejected() {
    let app = spawn_app();
    let mut token = app.access_token("user-1");
    token.push('x');

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_access_and_refresh_tokens() {
    let app = spawn_app();
    let access = app.access_token("user-1");
    let refresh = app.refresh_token("user-1");

    let body = format!(r#"{{"refresh_token":"{}"}}"#, refresh);
    let response = app.send(post_json("/auth/logout", Some(&access), &body)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.send(get_with_token("/auth/session", &access)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "Token has been revoked.");

    let body = format!(r#"{{"refresh_token":"{}"}}"#, refresh);
    let response = app.send(post_json("/auth/refresh", None, &body)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_without_body_revokes_access_token() {
    let app = spawn_app();
    let access = app.access_token("user-1");

    let request = Request::builder()
        .method("POST")
        .uri("/auth/logout")
        .header(header::AUTHORIZATION, format!("Bearer {}", access))
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::OK);

    let response = app.send(get_with_token("/auth/session", &access)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_exchanges_refresh_token_only() {
    let app = spawn_app();
    let refresh = app.refresh_token("user-1");

    let body = format!(r#"{{"refresh_token":"{}"}}"#, refresh);
    let response = app.send(post_json("/auth/refresh", None, &body)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let issued = body_json(response).await;
    assert_eq!(issued["token_type"], "bearer");
    assert!(issued.get("refresh_token").is_none());

    let access = issued["access_token"].as_str().unwrap();
    let response = app.send(get_with_token("/auth/session", access)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = format!(r#"{{"refresh_token":"{}"}}"#, access);
    let response = app.send(post_json("/auth/refresh", None, &body)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rotating_refresh_revokes_the_old_refresh_token() {
    let app = spawn_app();
    let refresh = app.refresh_token("user-1");

    let body = format!(r#"{{"refresh_token":"{}","rotate":true}}"#, refresh);
    let response = app.send(post_json("/auth/refresh", None, &body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let issued = body_json(response).await;
    let replacement = issued["refresh_token"].as_str().unwrap().to_string();

    let response = app.send(post_json("/auth/refresh", None, &body)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = format!(r#"{{"refresh_token":"{}"}}"#, replacement);
    let response = app.send(post_json("/auth/refresh", None, &body)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn body_at_limit_passes_and_one_byte_over_is_rejected() {
    let app = spawn_app();
    let token = app.access_token("user-1");

    let response = app
        .send(post_json("/auth/logout", Some(&token), &padded_body(MAX_BODY)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Validation runs before authentication, so no token is needed to see
    // the size rejection.
    let response = app
        .send(post_json("/auth/logout", None, &padded_body(MAX_BODY + 1)))
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["detail"], "Request body too large.");
}

#[tokio::test]
async fn declared_content_length_over_limit_is_rejected() {
    let app = spawn_app();

    let request = Request::builder()
        .method("POST")
        .uri("/auth/refresh")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, (MAX_BODY + 1).to_string())
        .body(Body::from(padded_body(MAX_BODY + 1)))
        .unwrap();

    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn sql_injection_in_body_is_blocked_before_auth() {
    let app = spawn_app();

    let response = app
        .send(post_json("/auth/logout", None, r#"{"q":"1 OR 1=1 --"}"#))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Invalid request body.");
    assert_eq!(
        body["errors"]["q"],
        "Field 'q' contains a potentially malicious pattern."
    );
}

#[tokio::test]
async fn path_traversal_in_query_is_blocked() {
    let app = spawn_app();
    let token = app.access_token("user-1");

    let response = app
        .send(get_with_token(
            "/auth/session?file=..%2F..%2Fetc%2Fpasswd",
            &token,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["detail"], "Invalid query parameters.");
}

#[tokio::test]
async fn log_only_mode_lets_violations_through() {
    let app = spawn_app_with(|config| config.validation.mode = ValidationMode::LogOnly);

    // The malicious value reaches the refresh handler, which rejects it as a
    // token rather than as an attack.
    let response = app
        .send(post_json("/auth/refresh", None, r#"{"refresh_token":"1 OR 1=1 --"}"#))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rate_limit_rejects_after_quota_with_headers() {
    let app = spawn_app_with(|config| {
        config.rate_limit.requests = 3;
        config.rate_limit.period_seconds = 60;
    });
    let token = app.access_token("user-1");

    for expected_remaining in ["2", "1", "0"] {
        let response = app.send(get_with_token("/auth/session", &token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected_remaining);
    }

    let response = app.send(get_with_token("/auth/session", &token)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert!(response.headers().get("x-ratelimit-reset").is_some());

    let body = body_json(response).await;
    assert_eq!(body["detail"], "Too many requests");
    assert_eq!(body["retry_after"], 60);
}

#[tokio::test]
async fn rate_limit_is_per_client() {
    let app = spawn_app_with(|config| config.rate_limit.requests = 1);
    let token = app.access_token("user-1");

    let from = |ip: &str| {
        Request::builder()
            .uri("/auth/session")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header("x-forwarded-for", ip.to_string())
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(app.send(from("10.0.0.1")).await.status(), StatusCode::OK);
    assert_eq!(
        app.send(from("10.0.0.1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(app.send(from("10.0.0.2")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejected_by_validation_is_not_counted_against_quota() {
    let app = spawn_app_with(|config| config.rate_limit.requests = 1);
    let token = app.access_token("user-1");

    let response = app
        .send(post_json("/auth/logout", Some(&token), r#"{"q":"1 OR 1=1 --"}"#))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.send(get_with_token("/auth/session", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_routes_require_admin_key() {
    let app = spawn_app();

    let response = app.send(get("/admin/keys")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/admin/keys")
        .header("x-admin-api-key", "wrong-key")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_rotation_adds_a_current_key() {
    let app = spawn_app();

    let request = Request::builder()
        .method("POST")
        .uri("/admin/keys/rotate")
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await;
    assert_eq!(rotated["rotated"], true);

    let request = Request::builder()
        .uri("/admin/keys")
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let listed = body_json(app.send(request).await).await;
    let keys = listed["keys"].as_array().unwrap();

    assert_eq!(keys.len(), 2);
    let current: Vec<_> = keys.iter().filter(|k| k["is_current"] == true).collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0]["key_id"], rotated["current_key_id"]);
    assert!(keys.iter().all(|k| k.get("wrapped_key").is_none()));
}

#[tokio::test]
async fn browser_client_hints_do_not_trip_validation() {
    let app = spawn_app();
    let token = app.access_token("user-1");

    let request = Request::builder()
        .method("POST")
        .uri("/auth/logout")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(
            "sec-ch-ua",
            r#""Chromium";v="124", "Google Chrome";v="124", "Not-A.Brand";v="99""#,
        )
        .header("sec-ch-ua-mobile", "?0")
        .header("sec-fetch-site", "same-origin")
        .header("forwarded", "for=192.0.2.60;proto=https")
        .body(Body::from("{}"))
        .unwrap();

    assert_eq!(app.send(request).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn jwt_sized_bodies_fit_the_test_limit() {
    let app = spawn_app();
    let body = format!(r#"{{"refresh_token":"{}","rotate":true}}"#, app.refresh_token("user-1"));
    assert!(body.len() < MAX_BODY);

    let response = app.send(post_json("/auth/refresh", None, &body)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["refresh_token"].is_string());
}

#[tokio::test]
async fn missing_role_is_forbidden_after_authentication() {
    let app = spawn_app_with(|config| {
        config
            .jwt
            .required_roles
            .insert("/auth/session".to_string(), vec!["admin".to_string()]);
    });
    let token = app.access_token("user-1");

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Bearer scope=\"admin\""
    );
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Not enough permissions. Required: admin");

    // Authentication still runs first.
    let response = app.send(get("/auth/session")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn held_role_passes_role_check() {
    let app = spawn_app_with(|config| {
        config
            .jwt
            .required_roles
            .insert("/auth/".to_string(), vec!["user".to_string()]);
    });
    let token = app.access_token("user-1");

    let response = app.send(get_with_token("/auth/session", &token)).await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn jwks_invalidation_needs_a_configured_source() {
    let app = spawn_app();

    let request = Request::builder()
        .method("POST")
        .uri("/admin/jwks/invalidate")
        .header("x-admin-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();

    assert_eq!(app.send(request).await.status(), StatusCode::NOT_FOUND);
}
