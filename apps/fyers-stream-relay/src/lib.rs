#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Fyers Stream Relay - Market Data Fan-out
//!
//! Holds exactly one authenticated WebSocket connection to the Fyers
//! data socket and multiplexes it to any number of downstream WebSocket
//! consumers. Also runs the credential exchange whose bearer token
//! gates that connection.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: ticks and the downstream JSON protocol
//!   - `subscription`: per-consumer instruments with reference counts
//!   - `credentials`: the bearer token
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: the upstream connector interface
//!   - `services`: upstream manager, fan-out, relay event loop, status
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `fyers`: tick decoder, data socket, login API, TOTP
//!   - `stream`: consumer WebSocket endpoint
//!   - `http`: control plane and server
//!   - `config`, `health`, `metrics`, `telemetry`, `service`
//!
//! # Data Flow
//!
//! ```text
//!                         +-------------+
//! Consumer 1 --subscribe->|             |--SUB_DATA--> +-----------+
//! Consumer 2 --subscribe->| Relay loop  |              | Fyers     |
//! Consumer N --subscribe->|             |<--frames---- | data      |
//!      ^                  +------+------+              | socket    |
//!      |                         |                     +-----------+
//!      +------- tick JSON -------+
//!
//! POST /api/auth/login --> Credential exchange --> token --> Relay loop
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::credentials::BearerToken;
pub use domain::streaming::{ConsumerCommand, DecodedTick, Instrument, OutboundMessage, Tick};
pub use domain::subscription::{ConsumerId, SubscriptionBook, SubscriptionStats};

// Relay services
pub use application::services::{
    Relay, RelayClosed, RelayHandle, RelayOptions, RelayStatus, UntaggedTickPolicy,
    UpstreamEndpoint, UpstreamState,
};

// Infrastructure config
pub use infrastructure::config::{
    AppCredentials, AuthSettings, ConfigError, Environment, FanOutSettings, RelayConfig,
    ServerSettings, UpstreamSettings,
};

// Fyers adapters (for integration tests)
pub use infrastructure::fyers::{
    AuthError, AuthStage, CredentialExchange, FyersSocketConnector, TickCodec,
};

// Server wiring
pub use infrastructure::service::{RelayService, StartupError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
