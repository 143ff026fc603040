//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Upstream frames received and rejected by the decoder
//! - **Fan-out**: Envelopes delivered to and dropped for consumers
//! - **Connections**: Upstream state, connect outcomes, consumer count
//! - **Auth**: Credential exchange attempts by flow and outcome
//! - **Latency**: Time to fan a decoded frame out to consumers
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the relay's HTTP port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream frames
    describe_counter!(
        "fyers_relay_frames_received_total",
        "Total binary frames decoded from the Fyers data socket"
    );
    describe_counter!(
        "fyers_relay_decode_errors_total",
        "Total upstream frames dropped as malformed"
    );

    // Fan-out
    describe_counter!(
        "fyers_relay_messages_sent_total",
        "Total envelopes queued to consumers"
    );
    describe_counter!(
        "fyers_relay_messages_dropped_total",
        "Total envelopes dropped for full or closed consumer queues"
    );
    describe_counter!(
        "fyers_relay_consumer_protocol_errors_total",
        "Total malformed messages received from consumers"
    );

    // Connections
    describe_gauge!(
        "fyers_relay_upstream_connected",
        "1 while the upstream data socket is open"
    );
    describe_counter!(
        "fyers_relay_upstream_connects_total",
        "Upstream connect attempts by outcome"
    );
    describe_counter!(
        "fyers_relay_upstream_lost_total",
        "Total upstream connections lost after opening or while connecting"
    );
    describe_gauge!("fyers_relay_consumers", "Connected downstream consumers");
    describe_gauge!(
        "fyers_relay_instruments",
        "Instruments with at least one subscriber"
    );

    // Auth
    describe_counter!(
        "fyers_relay_auth_attempts_total",
        "Credential exchange attempts by flow and outcome"
    );

    // Latency
    describe_histogram!(
        "fyers_relay_frame_fanout_seconds",
        "Time from decoded frame to envelopes queued"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an envelope was not delivered.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// The consumer's queue was full.
    QueueFull,
    /// The consumer's socket task has gone.
    ConsumerGone,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::ConsumerGone => "consumer_gone",
        }
    }
}

/// Outcome label for upstream connect attempts.
#[derive(Debug, Clone, Copy)]
pub enum ConnectOutcome {
    /// Socket opened.
    Opened,
    /// Socket failed to open.
    Failed,
}

impl ConnectOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Failed => "failed",
        }
    }
}

/// Credential exchange flow label.
#[derive(Debug, Clone, Copy)]
pub enum AuthFlow {
    /// Four-stage direct login.
    Direct,
    /// Redirect flow authorization code exchange.
    Code,
}

impl AuthFlow {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Code => "code",
        }
    }
}

/// Record one decoded upstream frame.
pub fn record_frame_received() {
    counter!("fyers_relay_frames_received_total").increment(1);
}

/// Record one malformed upstream frame.
pub fn record_decode_error() {
    counter!("fyers_relay_decode_errors_total").increment(1);
}

/// Record envelopes queued to consumers.
pub fn record_messages_sent(count: usize) {
    counter!("fyers_relay_messages_sent_total").increment(count as u64);
}

/// Record one envelope dropped for a consumer.
pub fn record_message_dropped(reason: DropReason) {
    counter!(
        "fyers_relay_messages_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a malformed consumer message.
pub fn record_consumer_protocol_error() {
    counter!("fyers_relay_consumer_protocol_errors_total").increment(1);
}

/// Record the outcome of an upstream connect attempt.
pub fn record_upstream_connect(outcome: ConnectOutcome) {
    counter!(
        "fyers_relay_upstream_connects_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record an upstream loss.
pub fn record_upstream_lost() {
    counter!("fyers_relay_upstream_lost_total").increment(1);
}

/// Update the upstream connected gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("fyers_relay_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update consumer and instrument gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_fanout_counts(consumers: usize, instruments: usize) {
    gauge!("fyers_relay_consumers").set(consumers as f64);
    gauge!("fyers_relay_instruments").set(instruments as f64);
}

/// Record a credential exchange attempt.
pub fn record_auth_attempt(flow: AuthFlow, outcome: &'static str) {
    counter!(
        "fyers_relay_auth_attempts_total",
        "flow" => flow.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record fan-out duration for one frame.
pub fn record_fanout_duration(duration: Duration) {
    histogram!("fyers_relay_frame_fanout_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
