//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`UpstreamConnector`]: opens the provider data socket and returns
//!   an [`UpstreamLink`] carrying control frames out and raw frames in.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::streaming::Instrument;

// =============================================================================
// Errors
// =============================================================================

/// Socket-level failure on the upstream connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamConnectionError {
    /// Handshake or transport failure while opening the socket.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The socket did not open within the configured timeout.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    /// The provider closed or rejected the connection.
    #[error("connection closed by provider (code {code:?}): {reason}")]
    Closed {
        /// WebSocket close code, if one was received.
        code: Option<u16>,
        /// Close reason or transport error text.
        reason: String,
    },

    /// The adapter task behind the link has gone away.
    #[error("upstream link closed")]
    LinkClosed,
}

// =============================================================================
// Link Types
// =============================================================================

/// Control action sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    /// Start streaming an instrument.
    Subscribe(Instrument),
    /// Stop streaming an instrument.
    Unsubscribe(Instrument),
}

/// Event produced by an open upstream link, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One binary message from the provider.
    Frame(Vec<u8>),
    /// The socket closed or failed. No further events follow.
    Closed {
        /// WebSocket close code, if one was received.
        code: Option<u16>,
        /// Close reason or transport error text.
        reason: String,
    },
}

/// An open upstream socket as seen by the relay.
///
/// Dropping `control` asks the adapter to close the socket.
#[derive(Debug)]
pub struct UpstreamLink {
    /// Outbound control commands.
    pub control: mpsc::Sender<UpstreamCommand>,
    /// Inbound frames and the final close event.
    pub inbound: mpsc::Receiver<LinkEvent>,
}

impl UpstreamLink {
    /// Bundle the two halves of a link.
    #[must_use]
    pub const fn new(
        control: mpsc::Sender<UpstreamCommand>,
        inbound: mpsc::Receiver<LinkEvent>,
    ) -> Self {
        Self { control, inbound }
    }
}

// =============================================================================
// Connector Port
// =============================================================================

/// Opens the single upstream data socket.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    /// Open a socket to `url`. Resolves once the socket is ready to
    /// accept control frames.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnectionError` if the socket cannot be opened.
    async fn connect(&self, url: &str) -> Result<UpstreamLink, UpstreamConnectionError>;
}

// =============================================================================
// Test Doubles
// =============================================================================
