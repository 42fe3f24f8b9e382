mod common;

use auth_gateway::models::MAX_OTP_FAILURES;
use axum::http::{HeaderValue, StatusCode};
use common::{
    body_json, get_request, json_request, set_cookie_header, set_cookie_value, TestApp,
    COOKIE_NAME, PASSWORD,
};
use serde_json::json;

#[tokio::test]
async fn test_password_then_otp_issues_session() {
    let app = TestApp::spawn().await;
    app.create_user("alice", "alice@example.test").await;

    let first = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"username": "alice", "password": PASSWORD}),
            None,
        ))
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(set_cookie_value(&first, COOKIE_NAME).is_none());
    let body = body_json(first).await;
    assert_eq!(body["requiresOtp"], true);
    assert_eq!(body["email"], "alice@example.test");

    let code = app.last_otp("alice@example.test");
    let second = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"username": "alice", "password": PASSWORD, "otpCode": code}),
            None,
        ))
        .await;
    assert_eq!(second.status(), StatusCode::OK);

    let header = set_cookie_header(&second, COOKIE_NAME).expect("session cookie");
    assert!(header.contains("HttpOnly"));
    assert!(header.contains("SameSite=Lax"));
    let key = set_cookie_value(&second, COOKIE_NAME).unwrap();
    let body = body_json(second).await;
    assert_eq!(body["username"], "alice");

    let me = app.send(get_request("/auth/me", Some(&key))).await;
    assert_eq!(me.status(), StatusCode::OK);
    let me = body_json(me).await;
    assert_eq!(me["username"], "alice");
    assert_eq!(me["isImpersonated"], false);
}

#[tokio::test]
async fn test_otp_is_single_use() {
    let app = TestApp::spawn().await;
    app.create_user("alice", "alice@example.test").await;

    let login = |code: Option<String>| {
        let mut body = json!({"username": "alice", "password": PASSWORD});
        if let Some(code) = code {
            body["otpCode"] = json!(code);
        }
        json_request("POST", "/auth/login", body, None)
    };

    app.send(login(None)).await;
    let code = app.last_otp("alice@example.test");

    let ok = app.send(login(Some(code.clone()))).await;
    assert_eq!(ok.status(), StatusCode::OK);

    let replay = app.send(login(Some(code))).await;
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_new_code_supersedes_old_one() {
    let app = TestApp::spawn().await;
    app.create_user("alice", "alice@example.test").await;
    let start = || {
        json_request(
            "POST",
            "/auth/login",
            json!({"username": "alice", "password": PASSWORD}),
            None,
        )
    };

    app.send(start()).await;
    let old = app.last_otp("alice@example.test");
    app.send(start()).await;
    let new = app.last_otp("alice@example.test");

    if old != new {
        let response = app
            .send(json_request(
                "POST",
                "/auth/login",
                json!({"username": "alice", "password": PASSWORD, "otpCode": old}),
                None,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_failures_are_indistinguishable() {
    let app = TestApp::spawn().await;
    app.create_user("alice", "alice@example.test").await;

    let wrong_password = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"username": "alice", "password": "not the password"}),
            None,
        ))
        .await;
    let unknown_user = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"username": "nobody", "password": PASSWORD}),
            None,
        ))
        .await;

    assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(wrong_password).await, body_json(unknown_user).await);
    assert!(app.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_login_without_otp_when_disabled() {
    let mut config = auth_gateway::config::GatewayConfig::for_tests();
    config.otp.enabled = false;
    let app = TestApp::with_config(config).await;
    app.create_user("alice", "alice@example.test").await;

    let response = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"username": "alice", "password": PASSWORD}),
            None,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie_value(&response, COOKIE_NAME).is_some());
}

#[tokio::test]
async fn test_logout_invalidates_session() {
    let app = TestApp::spawn().await;
    let user = app.create_user("alice", "alice@example.test").await;
    let key = app.session_for(&user).await;

    let response = app
        .send(json_request("POST", "/auth/logout", json!({}), Some(&key)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie_header(&response, COOKIE_NAME)
        .unwrap()
        .contains("Max-Age=0"));

    let me = app.send(get_request("/auth/me", Some(&key))).await;
    assert_eq!(me.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_is_rate_limited() {
    let mut config = auth_gateway::config::GatewayConfig::for_tests();
    config.rate_limit.login_attempts = 2;
    config.rate_limit.login_window_seconds = 3600;
    let app = TestApp::with_config(config).await;

    let attempt = || {
        json_request(
            "POST",
            "/auth/login",
            json!({"username": "nobody", "password": "whatever"}),
            None,
        )
    };
    assert_eq!(app.send(attempt()).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.send(attempt()).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.send(attempt()).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_code_is_burned_after_repeated_wrong_guesses() {
    let app = TestApp::spawn().await;
    app.create_user("alice", "alice@example.test").await;

    let login = |code: Option<&str>, hop: u8| {
        let mut body = json!({"username": "alice", "password": PASSWORD});
        if let Some(code) = code {
            body["otpCode"] = json!(code);
        }
        let mut request = json_request("POST", "/auth/login", body, None);
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_str(&format!("203.0.113.{}", hop)).unwrap(),
        );
        request
    };

    app.send(login(None, 1)).await;
    let code = app.last_otp("alice@example.test");
    let wrong = if code == "000000" { "000001" } else { "000000" };

    for hop in 0..MAX_OTP_FAILURES as u8 {
        let guess = app.send(login(Some(wrong), 10 + hop)).await;
        assert_eq!(guess.status(), StatusCode::UNAUTHORIZED);
    }

    let real = app.send(login(Some(&code), 99)).await;
    assert_eq!(real.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookie_value(&real, COOKIE_NAME).is_none());
}
