//! Route table and shared application state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::middleware::pipeline;
use super::proxy::Proxy;
use crate::auth::{KeyResolver, Principal, Scope, ScopePolicy, TokenVerifier, scopes};
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::{Error, Result};

/// A compiled route policy: config scope strings resolved to typed scopes
/// at startup, limiter class validated against the configured set.
pub struct RoutePolicy {
    /// Path prefix.
    pub path: String,
    /// Scope requirement.
    pub policy: ScopePolicy,
    /// Rate-limit class name.
    pub limiter: String,
    /// Whether unauthenticated callers are admitted as anonymous.
    pub optional_auth: bool,
}

/// Shared-credential fallback with env indirection already resolved.
pub struct ResolvedFallback {
    /// Expected username.
    pub username: String,
    /// Expected password.
    pub password: String,
    /// Scopes granted to fallback callers.
    pub scopes: BTreeSet<Scope>,
}

/// Shared application state.
pub struct GatewayState {
    /// Bearer token verifier.
    pub verifier: TokenVerifier,
    /// Shared-credential fallback, when enabled.
    pub fallback: Option<ResolvedFallback>,
    /// Compiled route policies, longest-prefix matched.
    pub routes: Vec<RoutePolicy>,
    /// Rate limiters by class name.
    pub limiters: HashMap<String, Arc<RateLimiter>>,
    /// Upstream proxy.
    pub proxy: Proxy,
    /// Prometheus render handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// Request body cap for proxied requests.
    pub max_body_size: usize,
}

impl GatewayState {
    /// Compile state from config. The key resolver is injected so tests
    /// can substitute an in-memory key source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on unknown scope names, unknown limiter
    /// classes, or an invalid algorithm name.
    pub fn build(
        config: &Config,
        resolver: Arc<KeyResolver>,
        metrics: PrometheusHandle,
    ) -> Result<Self> {
        let verifier = TokenVerifier::new(
            resolver,
            &config.auth.issuer,
            &config.auth.audience,
            &config.auth.algorithm,
            config.auth.clock_skew,
            config.auth.resolve_timeout,
        )?;

        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let policy = ScopePolicy::from_config(&route.scopes, route.mode)
                .map_err(|s| Error::Config(format!("route {}: unknown scope '{s}'", route.path)))?;
            routes.push(RoutePolicy {
                path: route.path.clone(),
                policy,
                limiter: route.limiter.clone(),
                optional_auth: route.optional_auth,
            });
        }

        let limiters = config
            .rate_limits
            .iter()
            .map(|(name, class)| {
                (
                    name.clone(),
                    Arc::new(RateLimiter::new(class.window, class.max_requests)),
                )
            })
            .collect();

        let fallback = if config.fallback.enabled {
            use crate::config::FallbackConfig;
            let username = config
                .fallback
                .username
                .as_deref()
                .map(FallbackConfig::resolve)
                .ok_or_else(|| Error::Config("fallback username missing".to_string()))?;
            let password = config
                .fallback
                .password
                .as_deref()
                .map(FallbackConfig::resolve)
                .ok_or_else(|| Error::Config("fallback password missing".to_string()))?;
            Some(ResolvedFallback {
                username,
                password,
                scopes: scopes::expand(&config.fallback.scopes),
            })
        } else {
            None
        };

        Ok(Self {
            verifier,
            fallback,
            routes,
            limiters,
            proxy: Proxy::new(&config.upstream)?,
            metrics,
            max_body_size: config.server.max_body_size,
        })
    }

    /// Longest-prefix route match. The default table carries a `/` entry,
    /// so every path matches something.
    #[must_use]
    pub fn match_route(&self, path: &str) -> Option<&RoutePolicy> {
        self.routes
            .iter()
            .filter(|r| path.starts_with(&r.path))
            .max_by_key(|r| r.path.len())
    }
}

/// Build the router with the full middleware stack.
pub fn create_router(state: Arc<GatewayState>, request_timeout: std::time::Duration) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/process", post(super::proxy::proxy_handler))
        .route("/ocr", post(super::proxy::proxy_handler))
        .route("/extract", post(super::proxy::proxy_handler))
        // Decision pipeline runs before any handler
        .layer(middleware::from_fn_with_state(Arc::clone(&state), pipeline))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Service banner.
async fn root_handler(
    principal: Option<axum::Extension<Principal>>,
) -> impl IntoResponse {
    let authenticated = principal.is_some_and(|p| p.0.is_authenticated());
    Json(json!({
        "service": "ocr-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "authenticated": authenticated,
        "endpoints": ["/health", "/process", "/ocr", "/extract", "/metrics"],
    }))
}

/// Liveness probe. Public by default.
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Prometheus exposition. Admin-gated by the default route table.
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchMode;

    fn route(path: &str) -> RoutePolicy {
        RoutePolicy {
            path: path.to_string(),
            policy: ScopePolicy {
                required: vec![],
                mode: MatchMode::All,
            },
            limiter: "general".to_string(),
            optional_auth: false,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let state_routes = vec![route("/"), route("/process"), route("/process/batch")];
        let best = state_routes
            .iter()
            .filter(|r| "/process/batch/x".starts_with(&r.path))
            .max_by_key(|r| r.path.len())
            .unwrap();
        assert_eq!(best.path, "/process/batch");

        let best = state_routes
            .iter()
            .filter(|r| "/unknown".starts_with(&r.path))
            .max_by_key(|r| r.path.len())
            .unwrap();
        assert_eq!(best.path, "/");
    }
}
