//! Shared helpers: a mock identity provider and token signing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const REALM: &str = "test";

pub const IDP_KEY_PEM: &str = include_str!("../fixtures/idp_key.pem");
pub const IDP_KEY_MODULUS: &str = "wI7g1Jumq8WP6bi6tVw4iFkYHnBqeL-XlTYGPruV7eMYZLpR1TTEdM6xVyORxLGR1Z5Di7AS1jXsjuOmKFFm4oy2v5Cbt7nlkrrwJKTv9Ryx1zNnIQQO6GTV7sK7jG7DJRP24dB52lkSQu0cOHzcnQlxFGS6dyD13KbJ9LQbXCcxiga4WNihb2hpEk_a4VNYp7gFJ7LfVgW9uE8_bPcPU3oK51T9AziK3dpN9MkKr2hvK-9wadWWcm_8M1y_1lK7RbndpkJ_aQpSS-ufxJb_6WjSGbsHh8jQuIzbVC9RQRrdl1wylnjxUq0wDnNkIPAKgKJlkHBXFO6C9jc1wjN3yw";

pub const ROTATED_KEY_PEM: &str = include_str!("../fixtures/rotated_key.pem");
pub const ROTATED_KEY_MODULUS: &str = "q-RX9TRlBzsl54m-ofMQgAJlZdn0V0f3y9ONspAO0T1er9UlhCk9OWsTq0zD8DxDMKjxa5TKCFmB4mnC-_yq_SdPE6VLHuIzDNk8BgOed0r_9mAJXhtBx3vGWX14U1ZniFAMpwdAafRNR2rCKrlFiVSqJtQk3PEbawaXkkWSL5UizvMZCvjnCkhPD_pmrfvkV-Hk2LemuKnvDw0qQ5PRv4YTfPIH_5e7S3cVWk5voOztbNY4bjXGdcxEotDglrsfFS3yxP0109j8zVRtOF5PZBHCRfPyTPbPV6qN3sJ_3MOvT4tELp5obUuF5BVQjO8Y3smKwlIgp4F_SvqV_9v7kw";

pub const RSA_EXPONENT: &str = "AQAB";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sign `claims` with RS256 using a PKCS#1 PEM key
pub fn sign(key_pem: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-key".to_string());
    let key = EncodingKey::from_rsa_pem(key_pem.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// Token signed by the provider's current key, valid for an hour
pub fn valid_token(username: &str) -> String {
    sign(
        IDP_KEY_PEM,
        &json!({ "sub": "user-1", "preferred_username": username, "exp": now() + 3600 }),
    )
}

/// Bind 127.0.0.1:0 and serve `router` in the background
pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Observable state of the mock identity provider
pub struct IdpState {
    pub jwks_modulus: Mutex<&'static str>,
    pub jwks_fetches: AtomicUsize,
    pub omit_jwks_uri: AtomicBool,
    pub token_status: Mutex<u16>,
    pub token_delay: Mutex<Duration>,
    pub access_token: Mutex<String>,
    pub token_forms: Mutex<Vec<HashMap<String, String>>>,
    pub logout_queries: Mutex<Vec<HashMap<String, String>>>,
}

/// Keycloak-shaped identity provider on a local port
pub struct MockIdp {
    pub addr: SocketAddr,
    pub state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn start() -> Self {
        let state = Arc::new(IdpState {
            jwks_modulus: Mutex::new(IDP_KEY_MODULUS),
            jwks_fetches: AtomicUsize::new(0),
            omit_jwks_uri: AtomicBool::new(false),
            token_status: Mutex::new(200),
            token_delay: Mutex::new(Duration::ZERO),
            access_token: Mutex::new(valid_token("alice")),
            token_forms: Mutex::new(Vec::new()),
            logout_queries: Mutex::new(Vec::new()),
        });

        let prefix = format!("/realms/{REALM}");
        let router = Router::new()
            .route(
                &format!("{prefix}/.well-known/openid-configuration"),
                get(discovery),
            )
            .route(&format!("{prefix}/protocol/openid-connect/certs"), get(certs))
            .route(&format!("{prefix}/protocol/openid-connect/token"), post(token))
            .route(&format!("{prefix}/protocol/openid-connect/logout"), get(logout))
            .with_state(Arc::clone(&state));

        let addr = serve(router).await;
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn issuer(&self) -> String {
        format!("http://{}/realms/{REALM}", self.addr)
    }

    pub fn jwks_fetches(&self) -> usize {
        self.state.jwks_fetches.load(Ordering::SeqCst)
    }

    pub fn rotate_key(&self) {
        *self.state.jwks_modulus.lock() = ROTATED_KEY_MODULUS;
    }
}

async fn discovery(State(state): State<Arc<IdpState>>, headers: axum::http::HeaderMap) -> Json<Value> {
    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if state.omit_jwks_uri.load(Ordering::SeqCst) {
        return Json(json!({ "issuer": format!("http://{host}/realms/{REALM}") }));
    }
    Json(json!({
        "issuer": format!("http://{host}/realms/{REALM}"),
        "jwks_uri": format!("http://{host}/realms/{REALM}/protocol/openid-connect/certs"),
    }))
}

async fn certs(State(state): State<Arc<IdpState>>) -> Json<Value> {
    state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
    let modulus = *state.jwks_modulus.lock();
    Json(json!({
        "keys": [
            { "kty": "EC", "kid": "ec-key", "crv": "P-256", "x": "AA", "y": "AA" },
            { "kty": "RSA", "kid": "test-key", "use": "sig", "alg": "RS256", "n": modulus, "e": RSA_EXPONENT }
        ]
    }))
}

async fn token(
    State(state): State<Arc<IdpState>>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    state.token_forms.lock().push(form);
    let delay = *state.token_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let status = StatusCode::from_u16(*state.token_status.lock()).unwrap();
    if status != StatusCode::OK {
        return (status, Json(json!({ "error": "invalid_grant" })));
    }
    let access_token = state.access_token.lock().clone();
    (
        StatusCode::OK,
        Json(json!({
            "access_token": access_token,
            "id_token": "id-token-value",
            "token_type": "Bearer",
            "expires_in": 300
        })),
    )
}

async fn logout(
    State(state): State<Arc<IdpState>>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    state.logout_queries.lock().push(query);
    StatusCode::OK
}

/// Listener that accepts and drops every connection, counting them
pub async fn counting_listener() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (addr, hits)
}
