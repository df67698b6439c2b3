//! Authentication: token verification, signature key resolution, scope policy.
//!
//! All rejection variants here map to an HTTP 401 with a deliberately
//! uniform external message; the specific variant is only ever written to
//! the audit log. Authorization failures (403) are not part of this
//! taxonomy — they are reported by [`scopes::ScopePolicy::evaluate`].

pub mod keys;
pub mod principal;
pub mod scopes;
pub mod verifier;

pub use keys::{HttpKeySource, KeyResolver, KeySource};
pub use principal::{AuthMethod, Principal};
pub use scopes::{Scope, ScopePolicy};
pub use verifier::TokenVerifier;

/// Why a credential was rejected.
///
/// Every variant is a 401. External callers see one generic message
/// regardless of variant; the distinction exists for the audit record.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential presented on a route that requires one.
    #[error("no credentials presented")]
    NoCredentials,

    /// The credential could not be parsed at all.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// The token header carries no `kid` field.
    #[error("token header missing 'kid'")]
    MissingKeyId,

    /// The `kid` is not in the key set, even after a forced refresh.
    #[error("unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The signature key could not be obtained (fetch failure or timeout).
    #[error("signature key unavailable: {0}")]
    Unverifiable(String),

    /// Signature verification failed, or the algorithm was not the pinned one.
    #[error("signature verification failed")]
    BadSignature,

    /// The token's `exp` is in the past (beyond skew tolerance).
    #[error("token expired")]
    Expired,

    /// The token's `nbf` is in the future (beyond skew tolerance).
    #[error("token not yet valid")]
    NotYetValid,

    /// A required claim is absent.
    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),

    /// The `aud` claim does not contain the pinned audience.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// The `iss` claim does not equal the pinned issuer.
    #[error("issuer mismatch")]
    IssuerMismatch,

    /// The shared-credential pair did not match.
    #[error("invalid shared credential")]
    BadCredential,
}

impl AuthError {
    /// Stable lowercase reason code for audit records and metrics labels.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoCredentials => "no_credentials",
            Self::Malformed(_) => "malformed",
            Self::MissingKeyId => "missing_kid",
            Self::UnknownKeyId(_) => "unknown_kid",
            Self::Unverifiable(_) => "unverifiable",
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::MissingClaim(_) => "missing_claim",
            Self::AudienceMismatch => "audience_mismatch",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::BadCredential => "bad_credential",
        }
    }
}
