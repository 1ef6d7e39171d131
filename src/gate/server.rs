//! Gate server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::engine::AuthEngine;
use super::router::create_router;
use crate::config::Config;
use crate::mtls::{PeerCertificateAcceptor, build_server_tls_config};
use crate::{Error, Result};

/// Time given to open connections after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Standalone forward-auth server
pub struct Server {
    config: Config,
    engine: Arc<AuthEngine>,
}

impl Server {
    /// Build the engine and validate the listener settings.
    ///
    /// # Errors
    ///
    /// Returns any configuration error from [`AuthEngine::from_config`].
    pub fn new(config: Config) -> Result<Self> {
        let engine = Arc::new(AuthEngine::from_config(&config)?);
        Ok(Self { config, engine })
    }

    /// Shared engine
    #[must_use]
    pub fn engine(&self) -> Arc<AuthEngine> {
        Arc::clone(&self.engine)
    }

    /// Listen address
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the host is not an IP address.
    pub fn addr(&self) -> Result<SocketAddr> {
        let host = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
        Ok(SocketAddr::new(host, self.config.server.port))
    }

    /// Serve until Ctrl-C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound, the TLS config
    /// cannot be built, or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = self.addr()?;
        let app = create_router(Arc::clone(&self.engine))
            .into_make_service_with_connect_info::<SocketAddr>();

        match &self.config.server.tls {
            None => {
                let listener = TcpListener::bind(addr).await?;
                info!(address = %addr, "Gate listening (plain HTTP, client certificates unavailable)");

                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal())
                    .await?;
            }
            Some(tls) => {
                let tls_config = build_server_tls_config(tls)?;
                let acceptor =
                    PeerCertificateAcceptor::new(RustlsConfig::from_config(Arc::new(tls_config)));

                let handle = axum_server::Handle::new();
                let shutdown = handle.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
                });

                info!(address = %addr, "Gate listening (TLS)");
                axum_server::bind(addr)
                    .acceptor(acceptor)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
        }

        info!("Gate shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str) -> Config {
        let mut config = Config {
            domain: "a.test".to_string(),
            ..Default::default()
        };
        config.server.host = host.to_string();
        config.server.port = 9443;
        config
    }

    #[test]
    fn addr_combines_host_and_port() {
        let server = Server::new(config("127.0.0.1")).unwrap();
        assert_eq!(server.addr().unwrap(), "127.0.0.1:9443".parse().unwrap());
        assert_eq!(server.engine().domain(), "a.test");
    }

    #[test]
    fn hostname_is_rejected_as_listen_address() {
        let server = Server::new(config("localhost")).unwrap();
        assert!(matches!(server.addr(), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_config_fails_construction() {
        let mut bad = config("127.0.0.1");
        bad.domain.clear();
        assert!(Server::new(bad).is_err());
    }
}
