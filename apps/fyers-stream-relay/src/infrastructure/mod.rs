//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Fyers wire codec, socket connector and credential exchange.
pub mod fyers;

/// Downstream consumer WebSocket endpoint.
pub mod stream;

/// HTTP server and control-plane routes.
pub mod http;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP routes.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Wiring from configuration to a running relay.
pub mod service;
