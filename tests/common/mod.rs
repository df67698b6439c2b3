//! Shared helpers for integration tests: Ed25519 test keys, an in-memory
//! key source, and gateway construction without any network key fetch.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, routing::post};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header, jwk::JwkSet};
use metrics_exporter_prometheus::PrometheusBuilder;
use rand_core::OsRng;
use serde_json::json;
use tokio::net::TcpListener;

use ocr_gateway::auth::{AuthError, KeyResolver, KeySource};
use ocr_gateway::config::{AuthConfig, Config, FallbackConfig, RateClassConfig, default_routes};
use ocr_gateway::gateway::{GatewayState, create_router};

pub const ISSUER: &str = "https://id.example.com";
pub const AUDIENCE: &str = "ocr-api";

/// A signing key with its published JWKS counterpart.
pub struct TestKeys {
    pub encoding: EncodingKey,
    pub jwks: JwkSet,
    pub kid: String,
}

/// PKCS#8 v1 DER wrapper for a raw Ed25519 seed (RFC 8410).
fn ed25519_pkcs8(seed: &[u8; 32]) -> Vec<u8> {
    let mut der = vec![
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
        0x20,
    ];
    der.extend_from_slice(seed);
    der
}

pub fn test_keys(kid: &str) -> TestKeys {
    let signing = SigningKey::generate(&mut OsRng);
    let encoding = EncodingKey::from_ed_der(&ed25519_pkcs8(&signing.to_bytes()));
    let x = URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes());
    let jwks = serde_json::from_value(json!({
        "keys": [{ "kty": "OKP", "crv": "Ed25519", "x": x, "kid": kid, "use": "sig" }]
    }))
    .expect("valid JWKS");
    TestKeys {
        encoding,
        jwks,
        kid: kid.to_string(),
    }
}

/// Key source serving a fixed JWKS from memory, counting fetches.
pub struct MemoryKeySource {
    jwks: parking_lot::Mutex<JwkSet>,
    calls: AtomicU64,
}

impl MemoryKeySource {
    pub fn new(jwks: JwkSet) -> Self {
        Self {
            jwks: parking_lot::Mutex::new(jwks),
            calls: AtomicU64::new(0),
        }
    }

    pub fn rotate(&self, jwks: JwkSet) {
        *self.jwks.lock() = jwks;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for MemoryKeySource {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.jwks.lock().clone())
    }
}

/// Sign a token with the test key, `kid` set in the header.
pub fn sign_token(keys: &TestKeys, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(keys.kid.clone());
    jsonwebtoken::encode(&header, claims, &keys.encoding).expect("token signs")
}

/// Standard claims valid for five minutes, with the given scope string.
pub fn claims(sub: &str, scope: &str) -> serde_json::Value {
    let now = Utc::now().timestamp();
    json!({
        "sub": sub,
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": now + 300,
        "iat": now,
        "jti": format!("jti-{sub}"),
        "scope": scope,
    })
}

/// Gateway config pointed at `upstream`, with a tight `heavy` limiter so
/// rate tests stay small. The fallback pair is ops/hunter2 granting read.
pub fn test_config(upstream: &str) -> Config {
    let mut rate_limits = HashMap::new();
    rate_limits.insert(
        "general".to_string(),
        RateClassConfig {
            window: Duration::from_secs(60),
            max_requests: 100,
        },
    );
    rate_limits.insert(
        "heavy".to_string(),
        RateClassConfig {
            window: Duration::from_secs(60),
            max_requests: 2,
        },
    );

    let mut config = Config {
        auth: AuthConfig {
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            jwks_url: "http://unused.invalid/jwks.json".to_string(),
            algorithm: "EdDSA".to_string(),
            ..Default::default()
        },
        fallback: FallbackConfig {
            enabled: true,
            username: Some("ops".to_string()),
            password: Some("hunter2".to_string()),
            scopes: vec!["read".to_string()],
        },
        rate_limits,
        routes: default_routes(),
        ..Default::default()
    };
    config.upstream.base_url = upstream.to_string();
    config
}

/// Build the real router over an in-memory key source and a local
/// (non-global) metrics recorder.
pub fn build_app(config: &Config, source: Arc<MemoryKeySource>) -> Router {
    let resolver = Arc::new(KeyResolver::new(source, config.auth.key_ttl));
    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let state = Arc::new(GatewayState::build(config, resolver, metrics).expect("state builds"));
    create_router(state, Duration::from_secs(5))
}

/// Spawn a stub OCR upstream on an ephemeral port and return its base URL.
pub async fn spawn_upstream() -> String {
    async fn echo(body: String) -> Json<serde_json::Value> {
        Json(json!({ "text": "ocr result", "received_bytes": body.len() }))
    }

    let app = Router::new()
        .route("/process", post(echo))
        .route("/ocr", post(echo))
        .route("/extract", post(echo));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
