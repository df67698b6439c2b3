//! Gateway server runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{GatewayState, create_router};
use crate::auth::{HttpKeySource, KeyResolver};
use crate::config::Config;
use crate::{Error, Result, telemetry};

/// OCR Gateway server.
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the gateway until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration, bind failure, or a
    /// server-level failure.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let metrics = telemetry::install_recorder()?;

        let key_source = HttpKeySource::new(
            &self.config.auth.jwks_url,
            self.config.auth.fetch_timeout,
        )
        .map_err(|e| Error::Config(e.to_string()))?;
        let resolver = Arc::new(KeyResolver::new(
            Arc::new(key_source),
            self.config.auth.key_ttl,
        ));

        let state = Arc::new(GatewayState::build(&self.config, resolver, metrics)?);

        // Periodic bucket cleanup so abandoned rate keys do not accumulate
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let purge_state = Arc::clone(&state);
        let mut purge_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for rate_limiter in purge_state.limiters.values() {
                            rate_limiter.purge_idle();
                        }
                    }
                    _ = purge_shutdown.recv() => break,
                }
            }
        });

        let app = create_router(Arc::clone(&state), self.config.server.request_timeout);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("OCR GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %self.config.auth.issuer, audience = %self.config.auth.audience, algorithm = %self.config.auth.algorithm, "Token verification");
        info!(upstream = %self.config.upstream.base_url, "Upstream OCR service");
        for route in &state.routes {
            info!(
                path = %route.path,
                limiter = %route.limiter,
                optional_auth = route.optional_auth,
                "Route"
            );
        }
        if self.config.fallback.enabled {
            warn!("Shared-credential fallback ENABLED - intended for non-production use only");
        }
        info!("============================================================");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM; notifies background tasks.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }

    let _ = shutdown_tx.send(());
}
