//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum clock-skew tolerance the verifier will accept.
///
/// Anything larger effectively disables expiration checking, so a config
/// asking for more is rejected at startup.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(10);

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Production-designated mode. When set, the shared-credential
    /// fallback must be disabled or the process refuses to start.
    pub production: bool,
    /// Server configuration
    pub server: ServerConfig,
    /// Token verification configuration
    pub auth: AuthConfig,
    /// Shared-credential (Basic) fallback configuration
    pub fallback: FallbackConfig,
    /// Named rate-limit classes
    pub rate_limits: HashMap<String, RateClassConfig>,
    /// Protected route policies
    pub routes: Vec<RouteConfig>,
    /// Upstream OCR service configuration
    pub upstream: UpstreamConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Token verification configuration.
///
/// Audience and issuer are pinned: a token whose `aud`/`iss` claims do not
/// exactly match these values is rejected even when otherwise valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Required `iss` claim value
    pub issuer: String,
    /// Required `aud` claim value
    pub audience: String,
    /// Key-set retrieval endpoint (JWKS)
    pub jwks_url: String,
    /// Pinned signature algorithm (e.g. `RS256`, `ES256`, `EdDSA`).
    /// The algorithm is never negotiated from the token header.
    pub algorithm: String,
    /// Allowed clock skew for temporal claims
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Cache lifetime for fetched signature keys
    #[serde(with = "humantime_serde")]
    pub key_ttl: Duration,
    /// Total timeout for an upstream key-set fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Caller-facing bound on key resolution. Kept much tighter than
    /// `fetch_timeout` so a slow key endpoint degrades to a fast failure.
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            jwks_url: String::new(),
            algorithm: "RS256".to_string(),
            clock_skew: Duration::from_secs(10),
            key_ttl: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared-credential (HTTP Basic) fallback configuration.
///
/// Disabled by default, and forbidden entirely in production mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Enable the Basic fallback scheme
    pub enabled: bool,
    /// Expected username (supports `env:VAR_NAME`)
    pub username: Option<String>,
    /// Expected password (supports `env:VAR_NAME`)
    pub password: Option<String>,
    /// Canonical scopes granted to fallback callers
    pub scopes: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: None,
            password: None,
            scopes: vec!["read".to_string(), "execute".to_string()],
        }
    }
}

impl FallbackConfig {
    /// Resolve a credential value (expand `env:VAR_NAME` indirection)
    #[must_use]
    pub fn resolve(value: &str) -> String {
        if let Some(var_name) = value.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }
}

/// A named rate-limit class: window length and maximum request count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateClassConfig {
    /// Window duration
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum requests per window per key
    pub max_requests: u32,
}

/// Scope match mode for a route policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every required scope must be held
    #[default]
    All,
    /// At least one required scope must be held
    Any,
}

/// A protected route policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Path prefix this policy applies to
    pub path: String,
    /// Required canonical scopes
    pub scopes: Vec<String>,
    /// ALL/ANY match semantics
    pub mode: MatchMode,
    /// Rate-limit class name
    pub limiter: String,
    /// Allow unauthenticated access (anonymous principal)
    pub optional_auth: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            scopes: Vec::new(),
            mode: MatchMode::All,
            limiter: "general".to_string(),
            optional_auth: false,
        }
    }
}

/// Upstream OCR service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the OCR/extraction backend
    pub base_url: String,
    /// Timeout for proxied requests
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

fn default_rate_limits() -> HashMap<String, RateClassConfig> {
    let mut classes = HashMap::new();
    classes.insert(
        "general".to_string(),
        RateClassConfig {
            window: Duration::from_secs(60),
            max_requests: 100,
        },
    );
    classes.insert(
        "heavy".to_string(),
        RateClassConfig {
            window: Duration::from_secs(60),
            max_requests: 20,
        },
    );
    classes
}

/// Default route table: OCR routes plus health/root/metrics.
///
/// `/process` runs the full OCR + extraction pipeline and sits behind the
/// stricter `heavy` limiter; `/metrics` exposes operational telemetry and
/// requires the administrative scope.
#[must_use]
pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig {
            path: "/health".to_string(),
            optional_auth: true,
            ..Default::default()
        },
        RouteConfig {
            path: "/metrics".to_string(),
            scopes: vec!["admin".to_string()],
            ..Default::default()
        },
        RouteConfig {
            path: "/process".to_string(),
            scopes: vec!["execute".to_string()],
            limiter: "heavy".to_string(),
            ..Default::default()
        },
        RouteConfig {
            path: "/ocr".to_string(),
            scopes: vec!["read".to_string()],
            limiter: "heavy".to_string(),
            ..Default::default()
        },
        RouteConfig {
            path: "/extract".to_string(),
            scopes: vec!["read".to_string()],
            ..Default::default()
        },
        RouteConfig {
            path: "/".to_string(),
            optional_auth: true,
            ..Default::default()
        },
    ]
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OCR_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("OCR_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        if config.rate_limits.is_empty() {
            config.rate_limits = default_rate_limits();
        }
        if config.routes.is_empty() {
            config.routes = default_routes();
        }

        Ok(config)
    }

    /// Validate startup invariants.
    ///
    /// A violation here is fatal: the process must refuse to start rather
    /// than degrade at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if:
    /// - production mode and the shared-credential fallback are both enabled
    /// - the fallback is enabled without a credential pair
    /// - the clock-skew tolerance exceeds [`MAX_CLOCK_SKEW`]
    /// - a route names an unknown rate-limit class
    pub fn validate(&self) -> Result<()> {
        if self.production && self.fallback.enabled {
            return Err(Error::Config(
                "shared-credential fallback must be disabled in production mode".to_string(),
            ));
        }

        if self.fallback.enabled
            && (self.fallback.username.is_none() || self.fallback.password.is_none())
        {
            return Err(Error::Config(
                "fallback enabled but username/password not configured".to_string(),
            ));
        }

        if self.auth.clock_skew > MAX_CLOCK_SKEW {
            return Err(Error::Config(format!(
                "clock_skew {}s exceeds maximum {}s",
                self.auth.clock_skew.as_secs(),
                MAX_CLOCK_SKEW.as_secs()
            )));
        }

        for route in &self.routes {
            if !self.rate_limits.contains_key(&route.limiter) {
                return Err(Error::Config(format!(
                    "route {} references unknown rate-limit class '{}'",
                    route.path, route.limiter
                )));
            }
        }

        Ok(())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // Parse "30s", "5m", etc.
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
