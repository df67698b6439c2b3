//! Structured audit records.
//!
//! Exactly one record is emitted per request, after the response is
//! decided — success and rejection alike. Emission can never fail the
//! request: a serialization problem is logged and swallowed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::AuthMethod;

/// How a request was ultimately disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Authorized and proxied upstream.
    Forwarded,
    /// Answered locally (health, banner, metrics).
    Served,
    /// Authentication failed (401).
    Unauthorized,
    /// Authenticated but lacking scopes (403).
    Forbidden,
    /// Over the rate limit (429).
    RateLimited,
    /// Upstream or internal failure (5xx).
    Error,
    /// Client disconnected before a response was produced.
    Aborted,
}

/// One request's audit trail entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Request ID (also returned to the caller in `x-request-id`).
    pub request_id: String,
    /// When the request completed.
    pub timestamp: DateTime<Utc>,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Caller network origin.
    pub remote_addr: String,
    /// Caller's `User-Agent` header, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Verified subject, absent for anonymous or failed auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Authentication method used.
    pub auth_method: AuthMethod,
    /// Validated token audience, when authenticated by token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Token ID (`jti` claim), when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Rejection reason code, present on denied requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Disposition of the request.
    pub outcome: Outcome,
    /// Response status code.
    pub status: u16,
    /// Canonical scopes the caller held.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub held_scopes: Vec<String>,
    /// Canonical scopes the route required.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<String>,
    /// Rate-limit bucket key, when a rate check ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_key: Option<String>,
    /// Seconds until the bucket resets, on 429 responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Request body size in bytes, 0 when unknown (streaming).
    pub request_bytes: u64,
    /// Response body size in bytes, 0 when unknown (streaming).
    pub response_bytes: u64,
    /// Total handling time in milliseconds.
    pub duration_ms: u64,
}

impl AuditRecord {
    /// Emit this record to the audit log stream.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => info!(target: "audit", audit = %json),
            Err(e) => warn!(request_id = %self.request_id, error = %e, "failed to serialize audit record"),
        }
    }
}
