//! Downstream Consumer Stream
//!
//! WebSocket endpoint (`GET /ws`) for downstream consumers. Each socket
//! becomes one relay consumer:
//!
//! - inbound JSON text frames are parsed into [`ConsumerCommand`]s and
//!   handed to the relay
//! - envelopes queued by the fan-out are written back as text frames
//! - the consumer is deregistered when the socket closes
//!
//! Malformed input is logged and ignored; it never closes the socket.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::application::services::RelayHandle;
use crate::domain::streaming::ConsumerCommand;
use crate::domain::subscription::ConsumerId;
use crate::infrastructure::metrics;

/// Malformed message from a consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerProtocolError {
    /// Not a valid command object.
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The command names no instrument.
    #[error("instrument must not be empty")]
    EmptyInstrument,

    /// Binary frames are not part of the protocol.
    #[error("unsupported frame type")]
    UnsupportedFrame,
}

/// Parse one consumer text frame.
///
/// # Errors
///
/// Returns `ConsumerProtocolError` if the text is not a subscribe or
/// unsubscribe command with a non-empty instrument.
pub fn parse_command(text: &str) -> Result<ConsumerCommand, ConsumerProtocolError> {
    let command: ConsumerCommand = serde_json::from_str(text)?;
    if command.instrument().trim().is_empty() {
        return Err(ConsumerProtocolError::EmptyInstrument);
    }
    Ok(command)
}

/// State for the consumer stream route.
#[derive(Debug, Clone)]
pub struct StreamState {
    relay: RelayHandle,
    consumer_buffer: usize,
}

impl StreamState {
    /// Create stream state. `consumer_buffer` bounds each consumer's
    /// outbound queue.
    #[must_use]
    pub fn new(relay: RelayHandle, consumer_buffer: usize) -> Self {
        Self {
            relay,
            consumer_buffer: consumer_buffer.max(1),
        }
    }
}

/// The `/ws` route.
pub fn routes(state: Arc<StreamState>) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<StreamState>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_consumer(socket, state))
}

async fn serve_consumer(socket: WebSocket, state: Arc<StreamState>) {
    let consumer: ConsumerId = Uuid::new_v4().as_u64_pair().0;
    let (outbox, mut queue) = mpsc::channel(state.consumer_buffer);

    if state.relay.connect(consumer, outbox).await.is_err() {
        tracing::warn!(consumer, "Relay is not running, dropping consumer");
        return;
    }
    tracing::info!(consumer, "Consumer connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            payload = queue.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                if sink.send(Message::Text(payload.as_ref().into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match parse_command(text.as_str()) {
                        Ok(command) => {
                            if state.relay.dispatch(consumer, command).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => reject(consumer, &e),
                    },
                    Some(Ok(Message::Binary(_))) => {
                        reject(consumer, &ConsumerProtocolError::UnsupportedFrame);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(consumer, error = %e, "Consumer socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = state.relay.disconnect(consumer).await;
    tracing::info!(consumer, "Consumer disconnected");
}

fn reject(consumer: ConsumerId, error: &ConsumerProtocolError) {
    tracing::warn!(consumer, error = %error, "Ignoring consumer message");
    metrics::record_consumer_protocol_error();
}
