//! Forwarding of authorized requests to the upstream OCR service.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use super::router::GatewayState;
use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Response-extension marker set on successfully proxied responses, so the
/// pipeline tail can tell a forwarded request from a locally served one.
#[derive(Debug, Clone, Copy)]
pub struct Proxied;

/// HTTP client for the upstream OCR service.
pub struct Proxy {
    client: reqwest::Client,
    base_url: Url,
}

impl Proxy {
    /// Build a proxy with its own timeout, independent of the server's.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is invalid or the client
    /// cannot be built.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid upstream base_url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build upstream client: {e}")))?;
        Ok(Self { client, base_url })
    }

    /// Forward a request and relay the upstream status and body.
    ///
    /// Only the content headers travel upstream; the caller's
    /// authorization never leaves the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] on transport failures (connect, timeout).
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Upstream(format!("bad upstream path: {e}")))?;
        url.set_query(query);

        let mut upstream = self.client.request(method, url).body(body);
        for name in [header::CONTENT_TYPE, header::ACCEPT] {
            if let Some(value) = headers.get(&name) {
                upstream = upstream.header(name.clone(), value.clone());
            }
        }
        if let Some(id) = headers.get("x-request-id") {
            upstream = upstream.header("x-request-id", id.clone());
        }

        let reply = upstream
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        let status = reply.status();
        let content_type = reply.headers().get(header::CONTENT_TYPE).cloned();
        let bytes = reply
            .bytes()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        debug!(status = %status, bytes = bytes.len(), "upstream reply");

        let mut response = Response::builder().status(status);
        if let Some(ct) = content_type {
            response = response.header(header::CONTENT_TYPE, ct);
        }
        response
            .body(Body::from(bytes))
            .map_err(|e| Error::Internal(e.to_string()))
    }
}

/// Handler for the proxied OCR routes. Authentication and rate limiting
/// already ran in the pipeline by the time this executes.
pub async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "payload_too_large" })),
            )
                .into_response();
        }
    };

    let query = parts.uri.query().map(str::to_string);
    match state
        .proxy
        .forward(
            parts.method,
            parts.uri.path(),
            query.as_deref(),
            &parts.headers,
            bytes,
        )
        .await
    {
        Ok(mut response) => {
            response.extensions_mut().insert(Proxied);
            response
        }
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "upstream_unavailable" })),
            )
                .into_response()
        }
    }
}
