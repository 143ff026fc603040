//! HTTP Server
//!
//! One axum server carries every relay surface:
//!
//! - `/ws` - downstream consumer stream
//! - `/api/auth/*` - control plane
//! - `/health`, `/healthz`, `/readyz`, `/metrics` - health and metrics

pub mod control;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use control::{ApiError, ControlState};

use crate::infrastructure::health::{self, HealthState};
use crate::infrastructure::stream::{self, StreamState};

/// Assemble the full router.
pub fn router(
    stream_state: Arc<StreamState>,
    control_state: Arc<ControlState>,
    health_state: Arc<HealthState>,
) -> Router {
    Router::new()
        .merge(stream::routes(stream_state))
        .merge(control::routes(control_state))
        .merge(health::routes(health_state))
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

/// The relay's HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Bind `0.0.0.0:port`. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::BindFailed` if the port cannot be bound.
    pub async fn bind(
        port: u16,
        app: Router,
        cancel: CancellationToken,
    ) -> Result<Self, HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(port, e.to_string()))?;
        Ok(Self {
            listener,
            app,
            cancel,
        })
    }

    /// Address actually bound.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until cancelled, then drain open connections.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::ServerFailed` if the server fails while
    /// running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "HTTP server listening");
        }

        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
