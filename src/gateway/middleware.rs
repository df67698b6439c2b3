//! The per-request decision pipeline.
//!
//! Runs as middleware ahead of every handler: authenticate, authorize,
//! rate-check, then forward. A failed stage short-circuits with the
//! appropriate status; every path, allowed or denied, flows through one
//! [`AuditGuard`] that emits the audit record and request metrics exactly
//! once — including when the client disconnects and the request future is
//! dropped mid-flight.
//!
//! Rejection responses are deliberately uneven in detail: 401 bodies are
//! uniform regardless of why verification failed (the reason goes to the
//! audit log only), while 403 names the required, missing, and held
//! scopes and 429 carries `Retry-After`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use http_body::Body as HttpBody;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::proxy::Proxied;
use super::router::{GatewayState, ResolvedFallback};
use crate::audit::{AuditRecord, Outcome};
use crate::auth::{AuthError, AuthMethod, Principal, Scope};
use crate::limiter::{self, Decision, RateKey};
use crate::telemetry;

/// Authenticate, authorize, rate-check, forward.
pub async fn pipeline(
    State(state): State<Arc<GatewayState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let origin = client_ip(&request);
    // Everything the pipeline needs from the request is copied out before
    // the first await so nothing borrows the request body across a
    // suspension point.
    let auth_header = request.headers().get(header::AUTHORIZATION).cloned();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_bytes = HttpBody::size_hint(request.body()).exact().unwrap_or(0);

    let mut guard = AuditGuard::new(
        AuditRecord {
            request_id: request_id(&request),
            timestamp: Utc::now(),
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
            remote_addr: origin.to_string(),
            user_agent,
            subject: None,
            auth_method: AuthMethod::None,
            audience: None,
            token_id: None,
            reason: None,
            outcome: Outcome::Served,
            status: 0,
            held_scopes: Vec::new(),
            required_scopes: Vec::new(),
            rate_key: None,
            retry_after_secs: None,
            request_bytes,
            response_bytes: 0,
            duration_ms: 0,
        },
        start,
    );

    let route = state.match_route(&guard.record.path);
    let optional_auth = route.is_some_and(|r| r.optional_auth);

    // Stage 1: authenticate
    let principal = match authenticate(&state, auth_header.as_ref(), optional_auth).await {
        Ok(principal) => principal,
        Err((method_label, err)) => {
            debug!(path = %guard.record.path, reason = err.reason(), "authentication rejected");
            telemetry::record_auth_attempt(method_label, err.reason());
            guard.record.reason = Some(err.reason().to_string());
            guard.record.outcome = Outcome::Unauthorized;
            return guard.finish(unauthorized_response());
        }
    };
    if principal.is_authenticated() {
        telemetry::record_auth_attempt(method_label(principal.method), "ok");
    }
    guard.record.subject = principal.subject.clone();
    guard.record.auth_method = principal.method;
    guard.record.audience = principal.audience.clone();
    guard.record.token_id = principal.token_id.clone();
    guard.record.held_scopes = principal.scopes.iter().map(ToString::to_string).collect();

    // Stage 2: authorize
    if let Some(route) = route {
        guard.record.required_scopes =
            route.policy.required.iter().map(ToString::to_string).collect();
        if let Err(missing) = route.policy.evaluate(&principal.scopes) {
            guard.record.reason = Some("insufficient_scope".to_string());
            guard.record.outcome = Outcome::Forbidden;
            let response =
                forbidden_response(&route.policy.required, &missing, &principal.scopes);
            return guard.finish(response);
        }
    }

    // Stage 3: rate limit
    if let Some(route) = route {
        if let Some(rate_limiter) = state.limiters.get(&route.limiter) {
            let key = RateKey::derive(&principal, origin);
            guard.record.rate_key = Some(key.to_string());
            if let Decision::Limited { retry_after } = rate_limiter.check(&key) {
                let secs = limiter::retry_after_secs(retry_after);
                telemetry::record_rate_limited(&route.limiter, key.kind());
                guard.record.reason = Some("rate_limited".to_string());
                guard.record.outcome = Outcome::RateLimited;
                guard.record.retry_after_secs = Some(secs);
                return guard.finish(rate_limited_response(secs));
            }
        }
    }

    // Stage 4: forward
    request.extensions_mut().insert(principal);
    let response = {
        let _inflight = InflightGuard::new();
        next.run(request).await
    };

    guard.record.outcome = if response.status().is_server_error() {
        Outcome::Error
    } else if response.extensions().get::<Proxied>().is_some() {
        Outcome::Forwarded
    } else {
        Outcome::Served
    };
    guard.finish(response)
}

/// Emits the audit record and request metrics exactly once per request.
///
/// The normal path goes through [`AuditGuard::finish`]. If the request
/// future is dropped before a response exists (client disconnect), the
/// `Drop` impl emits the record with whatever state the pipeline had
/// reached, marked aborted.
struct AuditGuard {
    record: AuditRecord,
    start: Instant,
    emitted: bool,
}

impl AuditGuard {
    fn new(record: AuditRecord, start: Instant) -> Self {
        Self {
            record,
            start,
            emitted: false,
        }
    }

    /// Stamp the final response onto the record, emit, and pass the
    /// response through.
    fn finish(mut self, response: Response) -> Response {
        self.record.status = response.status().as_u16();
        self.record.response_bytes = HttpBody::size_hint(response.body()).exact().unwrap_or(0);
        self.emit_now();
        response
    }

    fn emit_now(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        self.record.duration_ms =
            u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record.timestamp = Utc::now();
        self.record.emit();
        telemetry::record_request(
            &self.record.method,
            &self.record.path,
            self.record.status,
            self.record.subject.as_deref().unwrap_or("anonymous"),
            self.start.elapsed(),
        );
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if !self.emitted {
            self.record.outcome = Outcome::Aborted;
            self.record
                .reason
                .get_or_insert_with(|| "client_disconnected".to_string());
            self.emit_now();
        }
    }
}

/// Keeps the in-flight gauge honest even if the handler future is dropped.
struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        telemetry::inflight_add(1.0);
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        telemetry::inflight_add(-1.0);
    }
}

/// Resolve the caller's principal from the `Authorization` header value.
///
/// Presented credentials are always verified, even on optional-auth
/// routes; only a complete absence of credentials yields an anonymous
/// principal there.
async fn authenticate(
    state: &GatewayState,
    auth_header: Option<&HeaderValue>,
    optional_auth: bool,
) -> Result<Principal, (&'static str, AuthError)> {
    let header_value = match auth_header {
        Some(value) => value.to_str().map_err(|_| {
            (
                "unknown",
                AuthError::Malformed("non-ASCII authorization header".to_string()),
            )
        })?,
        None if optional_auth => return Ok(Principal::anonymous()),
        None => return Err(("none", AuthError::NoCredentials)),
    };

    if let Some(token) = header_value.strip_prefix("Bearer ") {
        return state.verifier.verify(token).await.map_err(|e| ("token", e));
    }

    if let Some(encoded) = header_value.strip_prefix("Basic ") {
        let Some(fallback) = &state.fallback else {
            return Err(("basic", AuthError::BadCredential));
        };
        return verify_basic(fallback, encoded).map_err(|e| ("basic", e));
    }

    Err((
        "unknown",
        AuthError::Malformed("unsupported authorization scheme".to_string()),
    ))
}

/// Constant-time shared-credential check. Username and password are both
/// compared unconditionally so a match on one leaks nothing about the other.
fn verify_basic(fallback: &ResolvedFallback, encoded: &str) -> Result<Principal, AuthError> {
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::Malformed("invalid basic credential encoding".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthError::Malformed("invalid basic credential encoding".to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::Malformed("invalid basic credential format".to_string()))?;

    let user_ok = username.as_bytes().ct_eq(fallback.username.as_bytes());
    let pass_ok = password.as_bytes().ct_eq(fallback.password.as_bytes());
    if bool::from(user_ok & pass_ok) {
        Ok(Principal::shared_credential(username, fallback.scopes.clone()))
    } else {
        Err(AuthError::BadCredential)
    }
}

/// Uniform 401. The body never varies with the rejection reason.
fn unauthorized_response() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "message": "authentication required",
        })),
    )
        .into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer realm=\"ocr-gateway\""),
    );
    response
}

/// 403 naming the required, missing, and held scopes.
fn forbidden_response(
    required: &[Scope],
    missing: &[Scope],
    held: &std::collections::BTreeSet<Scope>,
) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "insufficient_scope",
            "required": required.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "missing": missing.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "held": held.iter().map(ToString::to_string).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

/// 429 with `Retry-After` in whole seconds.
fn rate_limited_response(retry_after_secs: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limited",
            "retry_after": retry_after_secs,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn method_label(method: AuthMethod) -> &'static str {
    match method {
        AuthMethod::Token => "token",
        AuthMethod::SharedCredential => "basic",
        AuthMethod::None => "none",
    }
}

fn request_id(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

fn client_ip(request: &Request<Body>) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |info| info.0.ip())
}
