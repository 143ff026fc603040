//! Market Data Streaming Types
//!
//! Core domain types for the relay: the decoded tick, the commands a
//! downstream consumer may send, and the envelopes the relay sends back.
//! These types are codec-agnostic; the upstream binary format lives in
//! the Fyers adapter.

use serde::{Deserialize, Serialize};

/// An exchange-qualified instrument symbol, e.g. `NSE:SBIN-EQ`.
pub type Instrument = String;

/// Message sent to every consumer when the upstream connection drops.
pub const UPSTREAM_LOST_MESSAGE: &str = "Fyers connection lost.";

/// Message sent when a subscribe arrives and no bearer token is known.
pub const TOKEN_REQUIRED_MESSAGE: &str = "Access token is required.";

// =============================================================================
// Tick
// =============================================================================

/// One price/volume observation decoded from an upstream frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Last traded price.
    #[serde(rename = "ltp")]
    pub last_traded_price: f64,
    /// Traded volume.
    pub volume: i64,
}

/// A tick plus the instrument it belongs to, when the frame carried one.
///
/// The base three-field schema carries no symbol; the richer variant
/// appends it as field 4.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTick {
    /// The decoded tick.
    pub tick: Tick,
    /// Instrument symbol, if present in the frame.
    pub instrument: Option<Instrument>,
}

impl DecodedTick {
    /// A tick from a frame with no instrument field.
    #[must_use]
    pub const fn untagged(tick: Tick) -> Self {
        Self {
            tick,
            instrument: None,
        }
    }

    /// A tick from a frame that named its instrument.
    #[must_use]
    pub fn tagged(tick: Tick, instrument: impl Into<Instrument>) -> Self {
        Self {
            tick,
            instrument: Some(instrument.into()),
        }
    }
}

// =============================================================================
// Downstream Protocol
// =============================================================================

/// Command received from a downstream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConsumerCommand {
    /// Start receiving ticks for an instrument.
    Subscribe {
        /// Instrument to subscribe to.
        instrument: Instrument,
        /// Bearer token for the upstream connection, if the relay has none.
        #[serde(
            rename = "accessToken",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        access_token: Option<String>,
    },
    /// Stop receiving ticks for an instrument.
    Unsubscribe {
        /// Instrument to unsubscribe from.
        instrument: Instrument,
    },
}

impl ConsumerCommand {
    /// The instrument this command refers to.
    #[must_use]
    pub fn instrument(&self) -> &str {
        match self {
            Self::Subscribe { instrument, .. } | Self::Unsubscribe { instrument } => instrument,
        }
    }
}

/// Envelope sent from the relay to a downstream consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// A decoded tick.
    Tick {
        /// Tick payload.
        data: Tick,
    },
    /// A relay-side error or lifecycle event.
    Error {
        /// Human-readable message.
        message: String,
    },
}

impl OutboundMessage {
    /// Wrap a tick.
    #[must_use]
    pub const fn tick(tick: Tick) -> Self {
        Self::Tick { data: tick }
    }

    /// Wrap an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The upstream-lost notification.
    #[must_use]
    pub fn upstream_lost() -> Self {
        Self::error(UPSTREAM_LOST_MESSAGE)
    }

    /// The token-missing notification.
    #[must_use]
    pub fn token_required() -> Self {
        Self::error(TOKEN_REQUIRED_MESSAGE)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tick_envelope_uses_wire_field_names() {
        let msg = OutboundMessage::tick(Tick {
            timestamp: 1_700_000_000_000,
            last_traded_price: 512.35,
            volume: 1200,
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tick",
                "data": {"timestamp": 1_700_000_000_000_i64, "ltp": 512.35, "volume": 1200}
            })
        );
    }

    #[test]
    fn upstream_lost_envelope() {
        let value = serde_json::to_value(OutboundMessage::upstream_lost()).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "message": "Fyers connection lost."})
        );
    }

    #[test]
    fn subscribe_with_token_parses() {
        let cmd: ConsumerCommand = serde_json::from_str(
            r#"{"type":"subscribe","instrument":"NSE:SBIN-EQ","accessToken":"tok123"}"#,
        )
        .unwrap();

        assert_eq!(
            cmd,
            ConsumerCommand::Subscribe {
                instrument: "NSE:SBIN-EQ".to_string(),
                access_token: Some("tok123".to_string()),
            }
        );
    }

    #[test]
    fn subscribe_without_token_parses() {
        let cmd: ConsumerCommand =
            serde_json::from_str(r#"{"type":"subscribe","instrument":"NSE:SBIN-EQ"}"#).unwrap();

        assert!(matches!(
            cmd,
            ConsumerCommand::Subscribe { access_token: None, .. }
        ));
    }

    #[test]
    fn unsubscribe_parses() {
        let cmd: ConsumerCommand =
            serde_json::from_str(r#"{"type":"unsubscribe","instrument":"NSE:SBIN-EQ"}"#).unwrap();
        assert_eq!(cmd.instrument(), "NSE:SBIN-EQ");
    }

    #[test]
    fn unknown_command_type_rejected() {
        let result = serde_json::from_str::<ConsumerCommand>(r#"{"type":"resubscribe"}"#);
        assert!(result.is_err());
    }
}
