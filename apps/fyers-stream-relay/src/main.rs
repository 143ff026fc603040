//! Fyers Stream Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin fyers-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FYERS_APP_ID`: Fyers application id
//! - `FYERS_SECRET_KEY`: Fyers application secret
//! - `FYERS_REDIRECT_URI`: Redirect URI registered with the application
//! - `RELAY_PORT`: HTTP/WebSocket port (0 picks a free port)
//!
//! ## Optional
//! - `FYERS_SOCKET_URL`: Data socket URL (default: wss://socket.fyers.in/data-stream)
//! - `FYERS_LOGIN_BASE_URL`, `FYERS_API_BASE_URL`: Login API endpoints
//! - `RELAY_UPSTREAM_CONNECT_TIMEOUT_SECS`: Upstream connect timeout (default: 10)
//! - `RELAY_UPSTREAM_PING_INTERVAL_SECS`: Keep-alive ping interval, 0 disables (default: 30)
//! - `RELAY_AUTH_TIMEOUT_SECS`: Login API request timeout (default: 15)
//! - `RELAY_CONSUMER_BUFFER`, `RELAY_COMMAND_BUFFER`: Queue sizes (default: 1024)
//! - `RELAY_UNTAGGED_TICKS`: broadcast | drop (default: broadcast)
//! - `ENVIRONMENT`: development | production (default: development)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: fyers-stream-relay)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::Context;
use fyers_stream_relay::infrastructure::telemetry;
use fyers_stream_relay::{RelayConfig, RelayService, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Fyers Stream Relay");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let service = RelayService::from_config(&config, shutdown_token.clone())
        .await
        .context("failed to start relay")?;

    tokio::spawn(await_shutdown(shutdown_token));

    tracing::info!("Relay ready");
    service.run().await.context("relay server failed")?;

    tracing::info!("Relay stopped");
    Ok(())
}

/// Log the parsed configuration. Secrets are never logged.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        port = config.server.port,
        app_id = %config.credentials.app_id,
        untagged_ticks = config.fanout.untagged_ticks.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(
        socket_url = %config.upstream.socket_url,
        login_base_url = %config.auth.login_base_url,
        api_base_url = %config.auth.api_base_url,
        connect_timeout_secs = config.upstream.connect_timeout.as_secs(),
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
