//! Bearer token verification.
//!
//! # Verification flow
//!
//! 1. Decode the token header (no verification) to extract `kid`.
//! 2. Reject any algorithm other than the pinned one — the algorithm is
//!    configuration, never negotiated from the token.
//! 3. Resolve the decoding key by `kid`, bounded by `resolve_timeout`.
//! 4. Verify the signature and temporal claims (`exp`, `nbf`) with the
//!    configured clock-skew leeway.
//! 5. Check required claims (`sub`, `iss`, `aud`) are present.
//! 6. Check `iss` equals and `aud` contains the pinned values.
//! 7. Expand scope claims into a canonical [`Principal`].
//!
//! A failure at any step stops the flow; there is exactly one verification
//! attempt per request, no retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, TokenData, Validation, errors::ErrorKind};
use serde::Deserialize;

use super::{AuthError, KeyResolver, Principal, principal::AuthMethod, scopes};
use crate::{Error, Result};

/// Claims this gateway reads. Presence of the required ones is checked
/// manually so each absence maps to a distinct audit reason.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    iss: Option<String>,
    #[serde(default)]
    aud: Option<serde_json::Value>,
    exp: Option<i64>,
    #[serde(default)]
    jti: Option<String>,
    /// Space-delimited scope string (RFC 8693 style).
    #[serde(default)]
    scope: Option<String>,
    /// Array-form scope claim used by some issuers.
    #[serde(default)]
    scp: Option<Vec<String>>,
}

/// Verifies bearer tokens against a pinned issuer, audience, and algorithm.
pub struct TokenVerifier {
    resolver: Arc<KeyResolver>,
    issuer: String,
    audience: String,
    algorithm: Algorithm,
    clock_skew: Duration,
    resolve_timeout: Duration,
}

impl TokenVerifier {
    /// Build a verifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `algorithm` is not a recognized JWS
    /// algorithm name.
    pub fn new(
        resolver: Arc<KeyResolver>,
        issuer: &str,
        audience: &str,
        algorithm: &str,
        clock_skew: Duration,
        resolve_timeout: Duration,
    ) -> Result<Self> {
        let algorithm = algorithm
            .parse::<Algorithm>()
            .map_err(|_| Error::Config(format!("unknown token algorithm: {algorithm}")))?;
        Ok(Self {
            resolver,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            algorithm,
            clock_skew,
            resolve_timeout,
        })
    }

    /// Verify a bearer token and return the caller's principal.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] naming the first check that failed. All
    /// variants surface externally as the same 401.
    pub async fn verify(&self, token: &str) -> std::result::Result<Principal, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        if header.alg != self.algorithm {
            return Err(AuthError::BadSignature);
        }

        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;

        let key = tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(&kid))
            .await
            .map_err(|_| AuthError::Unverifiable("key resolution timed out".to_string()))??;

        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_nbf = true;
        // Audience checked manually below: supports both string and array
        // forms and maps to a distinct audit reason.
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        let token_data: TokenData<Claims> =
            jsonwebtoken::decode(token, &key, &validation).map_err(map_jwt_error)?;
        let claims = token_data.claims;

        let subject = claims.sub.ok_or(AuthError::MissingClaim("sub"))?;

        let issuer = claims.iss.ok_or(AuthError::MissingClaim("iss"))?;
        if issuer != self.issuer {
            return Err(AuthError::IssuerMismatch);
        }

        let aud = claims.aud.ok_or(AuthError::MissingClaim("aud"))?;
        if !audience_matches(&aud, &self.audience) {
            return Err(AuthError::AudienceMismatch);
        }

        let mut raw_scopes: Vec<String> = claims
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        raw_scopes.extend(claims.scp.unwrap_or_default());

        Ok(Principal {
            subject: Some(subject),
            method: AuthMethod::Token,
            scopes: scopes::expand(raw_scopes),
            issuer: Some(issuer),
            audience: Some(self.audience.clone()),
            expires_at: claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0)),
            token_id: claims.jti,
        })
    }
}

/// Map jsonwebtoken errors onto the rejection taxonomy.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::NotYetValid,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
        ErrorKind::MissingRequiredClaim(_) => AuthError::MissingClaim("exp"),
        _ => AuthError::Malformed(err.to_string()),
    }
}

/// The `aud` claim may be a single string or an array of strings.
fn audience_matches(aud: &serde_json::Value, expected: &str) -> bool {
    match aud {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => {
            arr.iter().any(|v| v.as_str() == Some(expected))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use ed25519_dalek::SigningKey;
    use jsonwebtoken::{EncodingKey, Header, jwk::JwkSet};
    use rand_core::OsRng;

    use super::*;
    use crate::auth::{KeySource, Scope};

    /// PKCS#8 v1 DER wrapper for a raw Ed25519 seed (RFC 8410).
    fn ed25519_pkcs8(seed: &[u8; 32]) -> Vec<u8> {
        let mut der = vec![
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20,
        ];
        der.extend_from_slice(seed);
        der
    }

    struct TestKeys {
        encoding: EncodingKey,
        jwks: JwkSet,
        kid: String,
    }

    fn test_keys(kid: &str) -> TestKeys {
        let signing = SigningKey::generate(&mut OsRng);
        let encoding = EncodingKey::from_ed_der(&ed25519_pkcs8(&signing.to_bytes()));
        let x = URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes());
        let jwks = serde_json::from_value(serde_json::json!({
            "keys": [{ "kty": "OKP", "crv": "Ed25519", "x": x, "kid": kid, "use": "sig" }]
        }))
        .unwrap();
        TestKeys {
            encoding,
            jwks,
            kid: kid.to_string(),
        }
    }

    struct StaticSource(JwkSet);

    #[async_trait]
    impl KeySource for StaticSource {
        async fn fetch(&self) -> std::result::Result<JwkSet, AuthError> {
            Ok(self.0.clone())
        }
    }

    fn verifier_for(keys: &TestKeys) -> TokenVerifier {
        let resolver = Arc::new(KeyResolver::new(
            Arc::new(StaticSource(keys.jwks.clone())),
            Duration::from_secs(300),
        ));
        TokenVerifier::new(
            resolver,
            "https://id.example.com",
            "ocr-api",
            "EdDSA",
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn sign(keys: &TestKeys, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(keys.kid.clone());
        jsonwebtoken::encode(&header, claims, &keys.encoding).unwrap()
    }

    fn base_claims() -> serde_json::Value {
        let now = Utc::now().timestamp();
        serde_json::json!({
            "sub": "user-42",
            "iss": "https://id.example.com",
            "aud": "ocr-api",
            "exp": now + 300,
            "iat": now,
            "jti": "tok-1",
            "scope": "read legacy:write",
        })
    }

    #[tokio::test]
    async fn valid_token_yields_canonical_principal() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let token = sign(&keys, &base_claims());

        let principal = verifier.verify(&token).await.unwrap();
        assert_eq!(principal.subject.as_deref(), Some("user-42"));
        assert_eq!(principal.method, AuthMethod::Token);
        assert_eq!(
            principal.scopes,
            BTreeSet::from([Scope::Read, Scope::Execute])
        );
        assert_eq!(principal.issuer.as_deref(), Some("https://id.example.com"));
        assert_eq!(principal.audience.as_deref(), Some("ocr-api"));
        assert_eq!(principal.token_id.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut claims = base_claims();
        claims["exp"] = serde_json::json!(Utc::now().timestamp() - 120);
        let token = sign(&keys, &claims);

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::Expired
        ));
    }

    #[tokio::test]
    async fn skew_boundary_accepts_within_leeway() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        // Expired 9s ago with a 10s leeway: inside the boundary.
        let mut claims = base_claims();
        claims["exp"] = serde_json::json!(Utc::now().timestamp() - 9);
        let token = sign(&keys, &claims);

        assert!(verifier.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn skew_boundary_rejects_beyond_leeway() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        // Expired 11s ago with a 10s leeway: just past the boundary.
        let mut claims = base_claims();
        claims["exp"] = serde_json::json!(Utc::now().timestamp() - 11);
        let token = sign(&keys, &claims);

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::Expired
        ));
    }

    #[tokio::test]
    async fn future_nbf_is_rejected() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut claims = base_claims();
        claims["nbf"] = serde_json::json!(Utc::now().timestamp() + 300);
        let token = sign(&keys, &claims);

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::NotYetValid
        ));
    }

    #[tokio::test]
    async fn audience_mismatch_is_rejected() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut claims = base_claims();
        claims["aud"] = serde_json::json!("some-other-api");
        let token = sign(&keys, &claims);

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::AudienceMismatch
        ));
    }

    #[tokio::test]
    async fn audience_array_form_matches() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut claims = base_claims();
        claims["aud"] = serde_json::json!(["other", "ocr-api"]);
        let token = sign(&keys, &claims);

        assert!(verifier.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn issuer_mismatch_is_rejected() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut claims = base_claims();
        claims["iss"] = serde_json::json!("https://rogue.example.com");
        let token = sign(&keys, &claims);

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::IssuerMismatch
        ));
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut claims = base_claims();
        claims.as_object_mut().unwrap().remove("sub");
        let token = sign(&keys, &claims);

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::MissingClaim("sub")
        ));
    }

    #[tokio::test]
    async fn missing_kid_is_rejected() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let header = Header::new(Algorithm::EdDSA); // no kid
        let token = jsonwebtoken::encode(&header, &base_claims(), &keys.encoding).unwrap();

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::MissingKeyId
        ));
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected_after_refresh() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some("never-published".to_string());
        let token = jsonwebtoken::encode(&header, &base_claims(), &keys.encoding).unwrap();

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::UnknownKeyId(_)
        ));
    }

    #[tokio::test]
    async fn wrong_signing_key_is_rejected() {
        // Token signed with a key whose kid matches a different published key.
        let published = test_keys("k1");
        let rogue = test_keys("k1");
        let verifier = verifier_for(&published);
        let token = sign(&rogue, &base_claims());

        assert!(matches!(
            verifier.verify(&token).await.unwrap_err(),
            AuthError::BadSignature
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let keys = test_keys("k1");
        let verifier = verifier_for(&keys);

        assert!(matches!(
            verifier.verify("not.a.token").await.unwrap_err(),
            AuthError::Malformed(_)
        ));
    }
}
