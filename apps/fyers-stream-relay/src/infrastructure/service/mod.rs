//! Service Wiring
//!
//! Builds the relay from configuration: status, event loop, credential
//! exchange and the HTTP server that fronts them.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::ports::UpstreamConnector;
use crate::application::services::{Relay, RelayStatus};
use crate::infrastructure::config::RelayConfig;
use crate::infrastructure::fyers::{CredentialExchange, ExchangeSetupError, FyersSocketConnector};
use crate::infrastructure::health::HealthState;
use crate::infrastructure::http::{self, ControlState, HttpServer, HttpServerError};
use crate::infrastructure::stream::StreamState;

/// Startup failure.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The credential exchange client could not be built.
    #[error(transparent)]
    Exchange(#[from] ExchangeSetupError),

    /// The HTTP listener could not be bound.
    #[error(transparent)]
    Http(#[from] HttpServerError),
}

/// A bound, not yet running relay.
pub struct RelayService {
    server: HttpServer,
    relay: Relay,
    status: Arc<RelayStatus>,
    cancel: CancellationToken,
}

impl RelayService {
    /// Build with the Fyers socket connector.
    ///
    /// # Errors
    ///
    /// Returns `StartupError` if the exchange client cannot be built or
    /// the port cannot be bound.
    pub async fn from_config(
        config: &RelayConfig,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let connector = FyersSocketConnector::new(config.upstream.ping_interval)
            .with_link_buffer(config.fanout.command_buffer);
        Self::build(config, Arc::new(connector), cancel).await
    }

    /// Build with any upstream connector.
    ///
    /// # Errors
    ///
    /// Same as [`RelayService::from_config`].
    pub async fn build(
        config: &RelayConfig,
        connector: Arc<dyn UpstreamConnector>,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let status = Arc::new(RelayStatus::new());
        let (relay, handle) = Relay::new(connector, config.relay_options(), Arc::clone(&status));
        let exchange = Arc::new(CredentialExchange::new(
            config.credentials.clone(),
            &config.auth,
        )?);

        let app = http::router(
            Arc::new(StreamState::new(
                handle.clone(),
                config.fanout.consumer_buffer,
            )),
            Arc::new(ControlState::new(exchange, handle.clone())),
            Arc::new(HealthState::new(
                env!("CARGO_PKG_VERSION").to_string(),
                Arc::clone(&status),
                handle,
            )),
        );
        let server = HttpServer::bind(config.server.port, app, cancel.clone()).await?;

        Ok(Self {
            server,
            relay,
            status,
            cancel,
        })
    }

    /// Address the HTTP server is bound to.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Shared status read by the health routes.
    #[must_use]
    pub fn status(&self) -> Arc<RelayStatus> {
        Arc::clone(&self.status)
    }

    /// Run the relay loop and HTTP server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if the server fails while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let relay = tokio::spawn(self.relay.run(self.cancel.clone()));

        let result = self.server.run().await;
        self.cancel.cancel();
        if let Err(e) = relay.await {
            tracing::error!(error = %e, "Relay event loop task failed");
        }
        result
    }
}
