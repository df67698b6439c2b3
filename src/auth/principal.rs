//! Verified caller identity.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::scopes::Scope;

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Verified bearer token.
    Token,
    /// Shared-credential (HTTP Basic) fallback.
    SharedCredential,
    /// No credential presented (optional-auth route).
    None,
}

/// The verified identity attached to a request after authentication.
///
/// Scopes are expanded to their canonical form at construction; nothing
/// downstream ever sees a raw scope string.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    /// Verified subject (`sub` claim), absent for anonymous callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// How the caller authenticated.
    pub method: AuthMethod,
    /// Canonical scopes held.
    pub scopes: BTreeSet<Scope>,
    /// Token issuer, when authenticated by token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Validated token audience, when authenticated by token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Token expiry, when authenticated by token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Token ID (`jti` claim), when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

impl Principal {
    /// An unauthenticated caller on an optional-auth route.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            subject: None,
            method: AuthMethod::None,
            scopes: BTreeSet::new(),
            issuer: None,
            audience: None,
            expires_at: None,
            token_id: None,
        }
    }

    /// A caller authenticated via the shared-credential fallback.
    #[must_use]
    pub fn shared_credential(username: &str, scopes: BTreeSet<Scope>) -> Self {
        Self {
            subject: Some(username.to_string()),
            method: AuthMethod::SharedCredential,
            scopes,
            issuer: None,
            audience: None,
            expires_at: None,
            token_id: None,
        }
    }

    /// Whether this principal carries a verified subject.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.method != AuthMethod::None
    }
}
