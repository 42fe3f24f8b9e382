mod common;

use axum::http::StatusCode;
use common::{body_json, get_request, TestApp};

#[tokio::test]
async fn health_check_reports_dependencies() {
    let app = TestApp::spawn().await;

    let response = app.send(get_request("/health", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "auth-gateway");
    assert_eq!(body["database"], "up");
    assert_eq!(body["sessionStore"], "up");
}

#[tokio::test]
async fn openapi_document_lists_gateway_routes() {
    let app = TestApp::spawn().await;

    let response = app.send(get_request("/.well-known/openapi.json", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    let paths = doc["paths"].as_object().unwrap();
    assert!(paths.contains_key("/auth/verify"));
    assert!(paths.contains_key("/auth/impersonation/start"));
    assert!(paths.contains_key("/auth/admin/impersonations/{id}/end"));
}

#[tokio::test]
async fn responses_carry_request_id_and_security_headers() {
    let app = TestApp::spawn().await;

    let response = app.send(get_request("/health", None)).await;

    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-content-type-options"));
}
