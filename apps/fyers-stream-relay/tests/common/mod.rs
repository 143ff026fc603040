//! Shared harness: a relay on an ephemeral port, a fake Fyers data socket
//! and WebSocket consumer helpers.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use fyers_stream_relay::{RelayConfig, RelayService, RelayStatus, UpstreamState};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);
pub const APP_ID: &str = "APP-100";

pub type Consumer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One accepted upstream connection.
pub struct ProviderConn {
    /// Request URI, including the access token query.
    pub uri: String,
    pub ws: WebSocketStream<TcpStream>,
}

impl ProviderConn {
    /// Next control frame sent by the relay, as JSON.
    pub async fn next_control(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for control frame")
                .expect("relay closed the socket")
                .expect("socket error");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    pub async fn send_frame(&mut self, frame: Vec<u8>) {
        self.ws.send(Message::Binary(frame.into())).await.unwrap();
    }
}

/// Fake Fyers data socket on `127.0.0.1:0`.
pub struct FakeProvider {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ProviderConn>,
}

impl FakeProvider {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/data-stream", listener.local_addr().unwrap());
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let captured = Arc::new(parking_lot::Mutex::new(String::new()));
                let sink = Arc::clone(&captured);
                let callback = move |request: &Request, response: Response| {
                    *sink.lock() = request.uri().to_string();
                    Ok(response)
                };
                let Ok(ws) = accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let uri = captured.lock().clone();
                if tx.send(ProviderConn { uri, ws }).is_err() {
                    break;
                }
            }
        });

        Self { url, connections }
    }

    pub async fn accept(&mut self) -> ProviderConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for upstream connection")
            .expect("provider stopped")
    }

    /// Assert no further connection arrives within `window`.
    pub async fn assert_no_connection(&mut self, window: Duration) {
        assert!(
            timeout(window, self.connections.recv()).await.is_err(),
            "unexpected second upstream connection"
        );
    }
}

/// Relay running on an ephemeral port.
pub struct RelayUnderTest {
    pub addr: SocketAddr,
    pub status: Arc<RelayStatus>,
    cancel: CancellationToken,
}

impl Drop for RelayUnderTest {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RelayUnderTest {
    /// Start a relay against `socket_url` with extra environment pairs.
    pub async fn start(socket_url: &str, extra: &[(&str, &str)]) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut pairs: Vec<(String, String)> = vec![
            ("FYERS_APP_ID".into(), APP_ID.into()),
            ("FYERS_SECRET_KEY".into(), "secret".into()),
            ("FYERS_REDIRECT_URI".into(), "https://example.com/cb".into()),
            ("RELAY_PORT".into(), "0".into()),
            ("RELAY_UPSTREAM_PING_INTERVAL_SECS".into(), "0".into()),
            ("RELAY_UPSTREAM_CONNECT_TIMEOUT_SECS".into(), "2".into()),
            ("FYERS_SOCKET_URL".into(), socket_url.into()),
        ];
        pairs.extend(extra.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));
        let config = RelayConfig::from_lookup(|key| {
            pairs
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let service = RelayService::from_config(&config, cancel.clone())
            .await
            .unwrap();
        let port = service.local_addr().unwrap().port();
        let status = service.status();
        tokio::spawn(service.run());

        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            status,
            cancel,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn consumer(&self) -> Consumer {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        ws
    }

    pub async fn wait_for_state(&self, state: UpstreamState) {
        timeout(WAIT, async {
            while self.status.state() != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("relay never reached {state:?}"));
    }

    pub async fn wait_for_consumers(&self, count: usize) {
        timeout(WAIT, async {
            while self.status.consumers() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("relay never reached {count} consumers"));
    }
}

pub async fn send_json(consumer: &mut Consumer, value: &Value) {
    send_text(consumer, &value.to_string()).await;
}

pub async fn send_text(consumer: &mut Consumer, text: &str) {
    consumer.send(Message::Text(text.into())).await.unwrap();
}

pub async fn recv_json(consumer: &mut Consumer) -> Value {
    loop {
        let message = timeout(WAIT, consumer.next())
            .await
            .expect("timed out waiting for relay message")
            .expect("relay closed the socket")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing arrives within `window`.
pub async fn assert_silent(consumer: &mut Consumer, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(window, consumer.next()).await {
        panic!("unexpected message: {text}");
    }
}
