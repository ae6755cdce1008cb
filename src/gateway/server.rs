//! HTTP server lifecycle for the gateway router.

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::GatewayError;

/// Configuration for the gateway server.
pub struct GatewayConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
}

/// Binds the gateway router and serves it until shut down.
pub struct GatewayServer {
    config: GatewayConfig,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Address actually bound, once started. Differs from the configured
    /// address when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the server task.
    pub async fn start(&mut self, app: Router) -> Result<(), GatewayError> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| GatewayError::BindFailed {
                addr: self.config.addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::BindFailed {
                addr: self.config.addr.to_string(),
                reason: e.to_string(),
            })?;
        self.local_addr = Some(local_addr);

        tracing::info!("Gateway listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Gateway shutting down");
                })
                .await
            {
                tracing::error!("Gateway server error: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop accepting connections, let in-flight requests finish, and wait
    /// for the server task.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    fn auto_config() -> GatewayConfig {
        GatewayConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_lifecycle() {
        let mut server = GatewayServer::new(auto_config());
        server
            .start(Router::new().route("/healthz", get(|| async { "ok" })))
            .await
            .expect("server should start on port 0");
        assert!(server.handle.is_some());
        assert!(server.local_addr().is_some_and(|addr| addr.port() != 0));

        server.shutdown().await;
        assert!(server.handle.is_none());
        assert!(server.shutdown_tx.is_none());
    }

    #[tokio::test]
    async fn serves_requests_until_shutdown() {
        let mut server = GatewayServer::new(auto_config());
        server
            .start(Router::new().route("/healthz", get(|| async { "ok" })))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let body = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        server.shutdown().await;
        assert!(reqwest::get(format!("http://{}/healthz", addr)).await.is_err());
    }

    #[tokio::test]
    async fn start_on_occupied_port_returns_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let occupied_addr = listener.local_addr().unwrap();

        let mut server = GatewayServer::new(GatewayConfig {
            addr: occupied_addr,
        });
        match server.start(Router::new()).await {
            Err(GatewayError::BindFailed { addr, .. }) => {
                assert_eq!(addr, occupied_addr.to_string());
            }
            Ok(()) => panic!("expected BindFailed"),
        }
    }

    #[tokio::test]
    async fn shutdown_when_not_started_is_noop() {
        let mut server = GatewayServer::new(auto_config());
        server.shutdown().await;
        assert!(server.local_addr().is_none());
    }
}
