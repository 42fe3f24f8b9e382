mod common;

use axum::{body::Body, http::{header, Request, StatusCode}};
use common::{TestApp, COOKIE_NAME};
use serde_json::json;

fn verify_request(cookie: Option<&str>, host: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri("/auth/verify");
    if let Some(key) = cookie {
        builder = builder.header(header::COOKIE, format!("{}={}", COOKIE_NAME, key));
    }
    if let Some(host) = host {
        builder = builder.header("x-forwarded-host", host);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_missing_cookie_is_401() {
    let app = TestApp::spawn().await;
    let response = app.send(verify_request(None, Some("wiki.example.test"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_session_is_401() {
    let app = TestApp::spawn().await;
    let response = app
        .send(verify_request(Some("not-a-session"), Some("wiki.example.test")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_session_is_401() {
    let app = TestApp::spawn().await;
    let user = app.create_user("erin", "erin@example.test").await;
    app.grant_application(&user, "wiki", json!({}));
    let key = app.session_for(&user).await;
    app.expire_session(&key);

    let response = app.send(verify_request(Some(&key), Some("wiki.example.test"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_user_with_role_is_allowed_with_identity_headers() {
    let app = TestApp::spawn().await;
    let user = app.create_user("alice", "alice@example.test").await;
    app.grant_application(&user, "wiki", json!({}));
    let key = app.session_for(&user).await;

    let response = app
        .send(verify_request(Some(&key), Some("Wiki.example.test:8443")))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-auth-user"], "alice");
    assert_eq!(headers["x-auth-email"], "alice@example.test");
    assert_eq!(headers["x-auth-session"], key.as_str());
    assert_eq!(headers["x-auth-is-admin"], "false");
    assert!(headers.get("x-auth-impersonator").is_none());
}

#[tokio::test]
async fn test_user_without_role_is_403() {
    let app = TestApp::spawn().await;
    let user = app.create_user("bob", "bob@example.test").await;
    app.grant_application(&user, "wiki", json!({}));
    let key = app.session_for(&user).await;

    let response = app.send(verify_request(Some(&key), Some("billing.example.test"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_host_is_403() {
    let app = TestApp::spawn().await;
    let user = app.create_user("bob", "bob@example.test").await;
    let key = app.session_for(&user).await;

    let response = app.send(verify_request(Some(&key), None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_inactive_application_is_403() {
    let app = TestApp::spawn().await;
    let user = app.create_user("carol", "carol@example.test").await;
    app.grant_application(&user, "wiki", json!({}));
    app.store.set_application_active("wiki", false).unwrap();
    let key = app.session_for(&user).await;

    let response = app.send(verify_request(Some(&key), Some("wiki.example.test"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_super_admin_skips_rbac_lookup() {
    let app = TestApp::spawn().await;
    let admin = app.create_super_admin("root").await;
    let key = app.session_for(&admin).await;

    let response = app.send(verify_request(Some(&key), Some("anything.example.test"))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-auth-is-admin"], "true");
    assert_eq!(app.store.access_queries(), 0);
}
