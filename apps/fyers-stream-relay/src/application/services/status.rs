//! Relay Status
//!
//! Shared, read-mostly view of the relay for the health endpoints. The
//! relay event loop is the only writer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::upstream::UpstreamState;

/// Connection and traffic counters for the relay.
#[derive(Debug)]
pub struct RelayStatus {
    state: parking_lot::RwLock<UpstreamState>,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_error: parking_lot::RwLock<Option<String>>,
    consumers: AtomicUsize,
    instruments: AtomicUsize,
    connect_attempts: AtomicU64,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl Default for RelayStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStatus {
    /// Fresh status: disconnected, all counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(UpstreamState::Disconnected),
            last_connected_at: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
            consumers: AtomicUsize::new(0),
            instruments: AtomicUsize::new(0),
            connect_attempts: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// A connect attempt has started.
    pub fn set_connecting(&self) {
        *self.state.write() = UpstreamState::Connecting;
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// The upstream socket is open.
    pub fn set_open(&self) {
        *self.state.write() = UpstreamState::Open;
        *self.last_connected_at.write() = Some(Utc::now());
        *self.last_error.write() = None;
    }

    /// The upstream socket is gone.
    pub fn set_disconnected(&self, error: Option<String>) {
        *self.state.write() = UpstreamState::Disconnected;
        if error.is_some() {
            *self.last_error.write() = error;
        }
    }

    /// Update consumer and instrument counts.
    pub fn set_counts(&self, consumers: usize, instruments: usize) {
        self.consumers.store(consumers, Ordering::Relaxed);
        self.instruments.store(instruments, Ordering::Relaxed);
    }

    /// Count one decoded frame.
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one malformed frame.
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current upstream state.
    #[must_use]
    pub fn state(&self) -> UpstreamState {
        *self.state.read()
    }

    /// Number of connected consumers.
    #[must_use]
    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every field.
    #[must_use]
    pub fn snapshot(&self) -> RelayStatusSnapshot {
        RelayStatusSnapshot {
            state: self.state(),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
            consumers: self.consumers.load(Ordering::Relaxed),
            instruments: self.instruments.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`RelayStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatusSnapshot {
    /// Upstream connection state.
    pub state: UpstreamState,
    /// When the upstream last opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent connection error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Connected consumers.
    pub consumers: usize,
    /// Instruments with at least one subscriber.
    pub instruments: usize,
    /// Connect attempts since start.
    pub connect_attempts: u64,
    /// Frames decoded since start.
    pub frames_received: u64,
    /// Malformed frames since start.
    pub decode_errors: u64,
}
