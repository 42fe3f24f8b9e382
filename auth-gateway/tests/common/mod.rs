//! Shared setup for gateway integration tests.
//!
//! Every test drives the real router with `oneshot` over in-memory stores,
//! so no PostgreSQL, Redis or SMTP is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use auth_gateway::{
    build_router,
    config::GatewayConfig,
    models::{Application, AuthProvider, Invitation, InvitationProvider, Role, User},
    services::{
        oauth::AuthorizationParams, session::SESSION_KEY_PREFIX, ClientInfo, ExternalProfile,
        GatewayError, InvitationRepository, MemorySessionBackend, MemoryStore, OAuthProvider,
        OAuthTokens, ProviderMap, RecordingNotifier, SessionStore, UserRepository,
    },
    utils::{hash_password, Password},
    AppState,
};
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tower::util::ServiceExt;

pub const PASSWORD: &str = "correct horse battery";
pub const COOKIE_NAME: &str = "gateway_session";
pub const GOOD_CODE: &str = "good-code";

/// Identity provider double. Only `GOOD_CODE` exchanges successfully and
/// the profile is whatever the test configured last.
pub struct FakeProvider {
    kind: AuthProvider,
    profile: Mutex<Option<ExternalProfile>>,
}

impl FakeProvider {
    pub fn new(kind: AuthProvider) -> Self {
        Self {
            kind,
            profile: Mutex::new(None),
        }
    }

    pub fn set_profile(&self, profile: ExternalProfile) {
        *self.profile.lock().unwrap() = Some(profile);
    }
}

#[async_trait]
impl OAuthProvider for FakeProvider {
    fn kind(&self) -> AuthProvider {
        self.kind
    }

    fn build_authorization_url(&self, params: &AuthorizationParams<'_>) -> String {
        format!(
            "https://idp.example.test/authorize?state={}",
            urlencoding::encode(&params.state())
        )
    }

    async fn exchange_code(&self, code: &str) -> Option<OAuthTokens> {
        (code == GOOD_CODE).then(|| OAuthTokens {
            access_token: "access-token".to_string(),
            id_token: None,
        })
    }

    async fn fetch_profile(&self, _access_token: &str) -> Result<ExternalProfile, GatewayError> {
        self.profile
            .lock()
            .unwrap()
            .clone()
            .ok_or(GatewayError::ProviderAuthFailed)
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MemorySessionBackend>,
    pub notifier: Arc<RecordingNotifier>,
    pub google: Arc<FakeProvider>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_config(GatewayConfig::for_tests()).await
    }

    pub async fn with_config(config: GatewayConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemorySessionBackend::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let google = Arc::new(FakeProvider::new(AuthProvider::Google));

        let sessions = SessionStore::new(backend.clone(), config.session.lifetime_seconds);
        let mut providers = ProviderMap::new();
        providers.insert(AuthProvider::Google, google.clone());

        let state = AppState::new(config, store.clone(), sessions, notifier.clone(), providers);
        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");

        Self {
            router,
            state,
            store,
            backend,
            notifier,
            google,
        }
    }

    /// Send one request through the full middleware stack.
    pub async fn send(&self, mut request: Request<Body>) -> Response<Body> {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 40000))));
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed")
    }

    pub async fn create_user(&self, username: &str, email: &str) -> User {
        let hash = hash_password(&Password::new(PASSWORD)).expect("hash");
        let user = User::new_local(username.to_string(), email.to_string(), hash.into_string());
        self.store.insert_user(&user).await.expect("insert user");
        user
    }

    pub async fn create_super_admin(&self, username: &str) -> User {
        let hash = hash_password(&Password::new(PASSWORD)).expect("hash");
        let mut user = User::new_local(
            username.to_string(),
            format!("{}@example.test", username),
            hash.into_string(),
        );
        user.is_super_admin = true;
        user.can_impersonate = true;
        self.store.insert_user(&user).await.expect("insert user");
        user
    }

    /// Session for `user` without going through the login flow.
    pub async fn session_for(&self, user: &User) -> String {
        self.state
            .sessions
            .create_session(
                user,
                user.is_super_admin || user.can_impersonate,
                &ClientInfo::default(),
            )
            .await
            .expect("create session")
    }

    pub async fn invitation(&self, email: &str, provider: InvitationProvider) -> Invitation {
        let invitation = Invitation::new(
            email.to_string(),
            provider,
            vec![],
            chrono::Duration::days(7),
            None,
        );
        self.store
            .insert_invitation(&invitation)
            .await
            .expect("insert invitation");
        invitation
    }

    /// Register an application and give `user` a role on it.
    pub fn grant_application(&self, user: &User, slug: &str, permissions: serde_json::Value) {
        let app = Application::new(slug, slug);
        let role = Role::new(app.application_id, "member", permissions);
        self.store.insert_application(app).unwrap();
        self.store.assign_role(user.user_id, role.role_id).unwrap();
        self.store.insert_role(role).unwrap();
    }

    pub fn expire_session(&self, key: &str) {
        self.backend.expire_now(&format!("{}{}", SESSION_KEY_PREFIX, key));
    }

    /// Six-digit code from the last sign-in email sent to `email`.
    pub fn last_otp(&self, email: &str) -> String {
        let mail = self.notifier.last_to(email).expect("no email sent");
        mail.body
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| part.len() == 6)
            .expect("no code in email")
            .to_string()
    }
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = cookie {
        builder = builder.header(header::COOKIE, format!("{}={}", COOKIE_NAME, key));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = cookie {
        builder = builder.header(header::COOKIE, format!("{}={}", COOKIE_NAME, key));
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

/// Value of a `Set-Cookie` for `name`, if the response set one.
pub fn set_cookie_value(response: &Response<Body>, name: &str) -> Option<String> {
    set_cookie_header(response, name).map(|raw| {
        raw.split(';')
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(_, value)| value.to_string())
            .unwrap_or_default()
    })
}

/// Full `Set-Cookie` header for `name`.
pub fn set_cookie_header(response: &Response<Body>, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&prefix))
        .map(str::to_string)
}

/// Let spawned audit writes land.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
