//! Server lifecycle management
//!
//! Binds the HTTP/WebSocket listener, serves until a shutdown signal, an
//! unexpected server stop or a fatal media failure, then shuts down gracefully.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use relaymesh_api::{create_router, AppState};
use relaymesh_sfu::ConnectionSupervisor;

use crate::config::Config;

/// Time allowed for open signaling channels to close once shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the server stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C or SIGTERM
    Signal,
    /// The HTTP server task ended on its own
    ServerStopped,
    /// The supervisor's termination signal fired after an unrecoverable failure
    Fatal(String),
}

pub struct RelayMeshServer {
    config: Config,
    supervisor: Arc<ConnectionSupervisor>,
}

impl RelayMeshServer {
    #[must_use]
    pub const fn new(config: Config, supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { config, supervisor }
    }

    /// Start serving and wait for a reason to stop
    pub async fn run(self) -> anyhow::Result<ShutdownReason> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        let reason = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                ShutdownReason::ServerStopped
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                ShutdownReason::Signal
            }
            () = self.supervisor.terminated() => {
                let reason = self
                    .supervisor
                    .fatal_reason()
                    .unwrap_or_else(|| "unknown failure".to_string());
                error!(reason = %reason, "Terminating after fatal failure");
                ShutdownReason::Fatal(reason)
            }
        };

        let _ = shutdown_tx.send(true);
        // A server task that already ended must not be awaited again
        let pending = (reason != ShutdownReason::ServerStopped).then_some(http_handle);
        self.shutdown(pending).await;

        Ok(reason)
    }

    async fn shutdown(&self, http_handle: Option<JoinHandle<()>>) {
        info!("Shutting down relaymesh server...");

        if let Some(handle) = http_handle {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!(
                    "HTTP server did not stop within {}s, proceeding with shutdown",
                    DRAIN_TIMEOUT.as_secs()
                );
            }
        }

        let active = self.supervisor.connection_count();
        if active > 0 {
            warn!("{} signaling channel(s) still open at shutdown", active);
        }

        info!("relaymesh server shut down");
    }

    /// Bind the listener and spawn the HTTP server with graceful shutdown support
    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let http_router = create_router(AppState::new(Arc::clone(&self.supervisor)));

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
