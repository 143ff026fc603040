//! Fyers Data Socket Connector
//!
//! [`UpstreamConnector`] backed by `tokio-tungstenite`. Each opened socket
//! gets one pump task that:
//!
//! - writes queued control commands as JSON text frames
//! - forwards binary frames to the relay unchanged
//! - answers pings and sends keep-alive pings of its own
//! - reports the close code when the socket ends
//!
//! Dropping the link's control sender closes the socket.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::messages::ControlFrame;
use crate::application::ports::{
    LinkEvent, UpstreamCommand, UpstreamConnectionError, UpstreamConnector, UpstreamLink,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the socket ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Opens the Fyers data socket over WebSocket.
#[derive(Debug, Clone)]
pub struct FyersSocketConnector {
    ping_interval: Option<Duration>,
    link_buffer: usize,
}

impl FyersSocketConnector {
    /// Create a connector. `None` disables keep-alive pings.
    #[must_use]
    pub fn new(ping_interval: Option<Duration>) -> Self {
        Self {
            ping_interval,
            link_buffer: 1024,
        }
    }

    /// Set the capacity of the per-link frame and control queues.
    #[must_use]
    pub fn with_link_buffer(mut self, link_buffer: usize) -> Self {
        self.link_buffer = link_buffer.max(1);
        self
    }
}

#[async_trait]
impl UpstreamConnector for FyersSocketConnector {
    async fn connect(&self, url: &str) -> Result<UpstreamLink, UpstreamConnectionError> {
        // The URL carries the token, so it is never logged
        let (socket, response) = connect_async(url).await.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                UpstreamConnectionError::Connect(format!(
                    "handshake rejected with HTTP {}",
                    response.status()
                ))
            }
            other => UpstreamConnectionError::Connect(other.to_string()),
        })?;
        tracing::debug!(status = %response.status(), "Fyers socket handshake complete");

        let (control_tx, control_rx) = mpsc::channel(self.link_buffer);
        let (event_tx, event_rx) = mpsc::channel(self.link_buffer);
        tokio::spawn(pump(socket, control_rx, event_tx, self.ping_interval));

        Ok(UpstreamLink::new(control_tx, event_rx))
    }
}

async fn pump(
    socket: Socket,
    mut control: mpsc::Receiver<UpstreamCommand>,
    events: mpsc::Sender<LinkEvent>,
    ping_interval: Option<Duration>,
) {
    let (mut write, mut read) = socket.split();
    let mut ping = ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let closed = loop {
        tokio::select! {
            command = control.recv() => {
                let Some(command) = command else {
                    tracing::debug!("Control channel dropped, closing Fyers socket");
                    let _ = write.send(Message::Close(None)).await;
                    return;
                };
                let frame = ControlFrame::from(command);
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize control frame");
                        continue;
                    }
                };
                tracing::debug!(frame = %json, "Sending control frame");
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    break transport_closed(&e);
                }
            }
            () = next_ping(&mut ping) => {
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    break transport_closed(&e);
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if events.send(LinkEvent::Frame(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(message = %text.as_str(), "Fyers text message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Fyers sent close frame");
                        break close_event(frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break transport_closed(&e),
                    None => {
                        break LinkEvent::Closed {
                            code: Some(ABNORMAL_CLOSURE),
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            }
        }
    };

    let _ = events.send(closed).await;
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn close_event(frame: Option<CloseFrame>) -> LinkEvent {
    match frame {
        Some(frame) => LinkEvent::Closed {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.as_str().to_string(),
        },
        None => LinkEvent::Closed {
            code: None,
            reason: "closed without status".to_string(),
        },
    }
}

fn transport_closed(error: &tokio_tungstenite::tungstenite::Error) -> LinkEvent {
    tracing::warn!(error = %error, "Fyers socket transport error");
    LinkEvent::Closed {
        code: Some(ABNORMAL_CLOSURE),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use super::*;

    async fn provider() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/data", listener.local_addr().unwrap());
        (url, listener)
    }

    #[tokio::test]
    async fn relays_frames_and_control() {
        let (url, listener) = provider().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected control frame");
            };
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            text.as_str().to_string()
        });

        let connector = FyersSocketConnector::new(None);
        let UpstreamLink {
            control,
            mut inbound,
        } = connector.connect(&url).await.unwrap();

        control
            .send(UpstreamCommand::Subscribe("NSE:SBIN-EQ".to_string()))
            .await
            .unwrap();

        assert_eq!(inbound.recv().await.unwrap(), LinkEvent::Frame(vec![1, 2, 3]));
        assert_eq!(
            inbound.recv().await.unwrap(),
            LinkEvent::Closed {
                code: Some(1001),
                reason: "bye".to_string()
            }
        );

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent, serde_json::json!({"T": "SUB_DATA", "symbol": ["NSE:SBIN-EQ"]}));
    }

    #[tokio::test]
    async fn dropped_connection_reports_abnormal_closure() {
        let (url, listener) = provider().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
        });

        let link = FyersSocketConnector::new(None).connect(&url).await.unwrap();
        let mut inbound = link.inbound;

        match inbound.recv().await.unwrap() {
            LinkEvent::Closed { code, .. } => assert_eq!(code, Some(ABNORMAL_CLOSURE)),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let (url, listener) = provider().await;
        drop(listener);

        let err = FyersSocketConnector::new(None).connect(&url).await.unwrap_err();
        assert!(matches!(err, UpstreamConnectionError::Connect(_)));
    }
}
