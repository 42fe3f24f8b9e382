mod common;

use auth_gateway::{
    models::InvitationProvider,
    services::{InvitationRepository, UserRepository},
};
use axum::http::StatusCode;
use common::{body_json, json_request, set_cookie_value, TestApp, COOKIE_NAME};
use serde_json::json;

fn register(token: &str, username: &str) -> axum::http::Request<axum::body::Body> {
    json_request(
        "POST",
        "/auth/register",
        json!({
            "token": token,
            "provider": "local",
            "username": username,
            "password": "a long enough password",
        }),
        None,
    )
}

#[tokio::test]
async fn test_invitation_registers_and_logs_in() {
    let app = TestApp::spawn().await;
    let invitation = app
        .invitation("new.hire@example.test", InvitationProvider::Local)
        .await;

    let response = app.send(register(&invitation.token, "newhire")).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(set_cookie_value(&response, COOKIE_NAME).is_some());
    let body = body_json(response).await;
    assert_eq!(body["username"], "newhire");
    assert_eq!(body["email"], "new.hire@example.test");
    assert!(app
        .store
        .find_user_by_username("newhire")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_invitation_is_single_use() {
    let app = TestApp::spawn().await;
    let invitation = app.invitation("a@example.test", InvitationProvider::Any).await;

    let first = app.send(register(&invitation.token, "first")).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app.send(register(&invitation.token, "second")).await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    assert!(app
        .store
        .find_user_by_username("second")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unknown_token_creates_nothing() {
    let app = TestApp::spawn().await;
    let response = app.send(register("deadbeef", "ghost")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app
        .store
        .find_user_by_username("ghost")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_provider_constrained_invitation_rejects_local() {
    let app = TestApp::spawn().await;
    let invitation = app
        .invitation("g@example.test", InvitationProvider::Google)
        .await;

    let response = app.send(register(&invitation.token, "guser")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_username_taken() {
    let app = TestApp::spawn().await;
    app.create_user("taken", "taken@example.test").await;
    let invitation = app.invitation("other@example.test", InvitationProvider::Any).await;

    let response = app.send(register(&invitation.token, "taken")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("Username"));
}

#[tokio::test]
async fn test_short_password_is_validation_error() {
    let app = TestApp::spawn().await;
    let invitation = app.invitation("a@example.test", InvitationProvider::Any).await;

    let response = app
        .send(json_request(
            "POST",
            "/auth/register",
            json!({"token": invitation.token, "provider": "local", "username": "abc", "password": "short"}),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_external_provider_is_refused_here() {
    let app = TestApp::spawn().await;
    let invitation = app.invitation("a@example.test", InvitationProvider::Any).await;

    let response = app
        .send(json_request(
            "POST",
            "/auth/register",
            json!({"token": invitation.token, "provider": "google", "username": "abc", "password": "a long enough password"}),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_concurrent_redemptions_have_one_winner() {
    let app = TestApp::spawn().await;
    let invitation = app.invitation("race@example.test", InvitationProvider::Local).await;

    let (first, second) = tokio::join!(
        app.send(register(&invitation.token, "first")),
        app.send(register(&invitation.token, "second")),
    );

    let (winner, loser) = match (first.status(), second.status()) {
        (StatusCode::CREATED, StatusCode::BAD_REQUEST) => ("first", second),
        (StatusCode::BAD_REQUEST, StatusCode::CREATED) => ("second", first),
        other => panic!("expected one success and one refusal, got {:?}", other),
    };
    let body = body_json(loser).await;
    assert_eq!(body["error"], "Invalid or expired invitation");

    let user = app
        .store
        .find_user_by_username(winner)
        .await
        .unwrap()
        .expect("winner registered");
    let used = app
        .store
        .find_invitation_by_token(&invitation.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(used.used_by_user_id, Some(user.user_id));
    assert_eq!(
        app.store
            .find_user_by_email("race@example.test")
            .await
            .unwrap()
            .map(|u| u.user_id),
        Some(user.user_id)
    );
}
