//! Health Check and Metrics Endpoint
//!
//! HTTP routes for health checks, connection status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (relay loop running)
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! The upstream socket opens lazily on the first subscribe, so a
//! disconnected upstream with no recorded error is the normal idle state
//! and counts as healthy.

use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::application::services::{RelayHandle, RelayStatus, RelayStatusSnapshot, UpstreamState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream connection and traffic counters.
    pub relay: RelayStatusSnapshot,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Upstream connecting or lost; consumers must resubscribe.
    Degraded,
    /// The relay event loop has stopped.
    Unhealthy,
}

// =============================================================================
// Health State
// =============================================================================

/// Shared state for the health routes.
pub struct HealthState {
    version: String,
    started_at: Instant,
    status: Arc<RelayStatus>,
    relay: RelayHandle,
}

impl HealthState {
    /// Create new health state.
    #[must_use]
    pub fn new(version: String, status: Arc<RelayStatus>, relay: RelayHandle) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            status,
            relay,
        }
    }
}

/// Health, probe and metrics routes.
pub fn routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.relay.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthState) -> HealthResponse {
    let snapshot = state.status.snapshot();
    HealthResponse {
        status: determine_health_status(state.relay.is_closed(), &snapshot),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        relay: snapshot,
    }
}

fn determine_health_status(relay_closed: bool, snapshot: &RelayStatusSnapshot) -> HealthStatus {
    if relay_closed {
        return HealthStatus::Unhealthy;
    }
    match snapshot.state {
        UpstreamState::Open => HealthStatus::Healthy,
        UpstreamState::Connecting => HealthStatus::Degraded,
        UpstreamState::Disconnected if snapshot.last_error.is_some() => HealthStatus::Degraded,
        UpstreamState::Disconnected => HealthStatus::Healthy,
    }
}

// =============================================================================
// Tests
// =============================================================================
