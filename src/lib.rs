//! OCR Gateway Library
//!
//! Request authentication and authorization gateway for the receipt OCR
//! services. Every inbound request passes through a single decision
//! pipeline:
//!
//! 1. **Token verification** — bearer JWT signature and claim validation
//!    against a pinned issuer/audience, with JWKS caching and rotation
//!    tolerance.
//! 2. **Scope authorization** — typed scope policy per route, with legacy
//!    scope aliases expanded to their canonical equivalents.
//! 3. **Rate limiting** — fixed-window counters keyed by verified subject,
//!    falling back to network origin for unauthenticated callers.
//! 4. **Audit & metrics** — one structured audit record and a metrics
//!    update for every completed request, success or rejection.
//!
//! Authorized requests are proxied to the upstream OCR service; the
//! business logic itself lives outside this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod telemetry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
