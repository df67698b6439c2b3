//! Signature key resolution — JWKS caching, rotation, and refresh coalescing.
//!
//! Keys are cached by `kid` for a configurable TTL. A token presenting an
//! unknown `kid` forces exactly one refresh before failing, which is how
//! key rotation is absorbed without restarts. Concurrent misses coalesce
//! onto a single upstream fetch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use tracing::{debug, warn};

use super::AuthError;

/// Where signature keys come from. Injectable so tests never need a
/// network listener.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, AuthError>;
}

/// HTTP key source: fetches a JWKS document from a fixed URL.
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    /// Build a source with its own bounded-timeout client, independent of
    /// the server's request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unverifiable`] if the HTTP client cannot be built.
    pub fn new(url: &str, fetch_timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| AuthError::Unverifiable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        debug!(url = %self.url, "fetching signature key set");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::Unverifiable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Unverifiable(format!(
                "key endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::Unverifiable(e.to_string()))
    }
}

/// Caching key resolver.
pub struct KeyResolver {
    source: Arc<dyn KeySource>,
    keys: DashMap<String, Arc<DecodingKey>>,
    /// Serializes refreshes. The guarded value is unused; coalescing is
    /// decided by the generation re-check after acquisition.
    refresh: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    deadline: parking_lot::Mutex<Option<Instant>>,
    ttl: Duration,
}

impl KeyResolver {
    /// Create a resolver over the given source with the given cache TTL.
    pub fn new(source: Arc<dyn KeySource>, ttl: Duration) -> Self {
        Self {
            source,
            keys: DashMap::new(),
            refresh: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            deadline: parking_lot::Mutex::new(None),
            ttl,
        }
    }

    /// Resolve a decoding key by `kid`.
    ///
    /// Cache hit on a fresh entry returns immediately. A stale cache or an
    /// unknown `kid` triggers at most one refresh; if the `kid` is still
    /// absent afterwards the token is rejected.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unverifiable`] if the source fails,
    /// [`AuthError::UnknownKeyId`] if the `kid` survives a refresh unmatched.
    pub async fn resolve(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        if self.is_fresh() {
            if let Some(key) = self.keys.get(kid) {
                return Ok(key.value().clone());
            }
            debug!(kid = %kid, "kid not in cached key set, refreshing");
        }

        let observed = self.generation.load(Ordering::Acquire);
        self.refresh_keys(observed).await?;

        self.keys
            .get(kid)
            .map(|key| key.value().clone())
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }

    /// Number of refreshes performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_fresh(&self) -> bool {
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Refresh the cache unless another caller already did since
    /// `observed` was read. Concurrent misses all observe the same
    /// generation, so exactly one of them fetches.
    async fn refresh_keys(&self, observed: u64) -> Result<(), AuthError> {
        let _guard = self.refresh.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            return Ok(());
        }

        let jwks = self.source.fetch().await?;

        self.keys.clear();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.as_deref() else {
                continue;
            };
            match decoding_key(&jwk.algorithm) {
                Some(key) => {
                    self.keys.insert(kid.to_string(), Arc::new(key));
                }
                None => warn!(kid = %kid, "skipping key with unsupported parameters"),
            }
        }

        *self.deadline.lock() = Some(Instant::now() + self.ttl);
        self.generation.fetch_add(1, Ordering::Release);
        debug!(keys = self.keys.len(), "signature key set refreshed");
        Ok(())
    }
}

/// Convert JWK parameters to a `DecodingKey`. RSA, EC, and Ed25519 keys
/// are supported; symmetric keys are never accepted from a remote set.
fn decoding_key(params: &AlgorithmParameters) -> Option<DecodingKey> {
    match params {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x).ok(),
        AlgorithmParameters::OctetKey(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSource {
        calls: AtomicU64,
        keys: parking_lot::Mutex<JwkSet>,
    }

    impl CountingSource {
        fn new(kids: &[&str]) -> Self {
            Self {
                calls: AtomicU64::new(0),
                keys: parking_lot::Mutex::new(jwk_set(kids)),
            }
        }

        fn rotate(&self, kids: &[&str]) {
            *self.keys.lock() = jwk_set(kids);
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySource for CountingSource {
        async fn fetch(&self) -> Result<JwkSet, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.keys.lock().clone())
        }
    }

    /// A syntactically valid Ed25519 JWK per kid (32 zero bytes is a valid
    /// curve point encoding for parsing purposes).
    fn jwk_set(kids: &[&str]) -> JwkSet {
        let keys: Vec<serde_json::Value> = kids
            .iter()
            .map(|kid| {
                serde_json::json!({
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "x": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                    "kid": kid,
                    "use": "sig",
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "keys": keys })).unwrap()
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_fetch() {
        let source = Arc::new(CountingSource::new(&["k1"]));
        let resolver = KeyResolver::new(source.clone(), Duration::from_secs(300));

        resolver.resolve("k1").await.unwrap();
        resolver.resolve("k1").await.unwrap();
        resolver.resolve("k1").await.unwrap();

        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_triggers_exactly_one_refresh() {
        let source = Arc::new(CountingSource::new(&["k1"]));
        let resolver = KeyResolver::new(source.clone(), Duration::from_secs(300));

        resolver.resolve("k1").await.unwrap();
        assert_eq!(source.calls(), 1);

        // Rotation: new kid appears upstream, gateway absorbs it via one
        // forced refresh.
        source.rotate(&["k1", "k2"]);
        resolver.resolve("k2").await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn missing_kid_fails_after_single_refresh() {
        let source = Arc::new(CountingSource::new(&["k1"]));
        let resolver = KeyResolver::new(source.clone(), Duration::from_secs(300));

        let err = resolver.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownKeyId(kid) if kid == "ghost"));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn expired_ttl_refetches() {
        let source = Arc::new(CountingSource::new(&["k1"]));
        let resolver = KeyResolver::new(source.clone(), Duration::ZERO);

        resolver.resolve("k1").await.unwrap();
        resolver.resolve("k1").await.unwrap();

        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let source = Arc::new(CountingSource::new(&["k1"]));
        let resolver = Arc::new(KeyResolver::new(source.clone(), Duration::from_secs(300)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let resolver = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move { resolver.resolve("k1").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(source.calls(), 1);
        assert_eq!(resolver.refresh_count(), 1);
    }
}
