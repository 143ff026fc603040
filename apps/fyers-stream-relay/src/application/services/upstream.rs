//! Upstream Connection Manager
//!
//! Owns the single connection to the Fyers data socket.
//!
//! # States
//!
//! ```text
//! Disconnected ──ensure_connected──► Connecting ──opened──► Open
//!      ▲                                  │                   │
//!      └──────── connect failed ──────────┘◄──── closed ──────┘
//! ```
//!
//! `ensure_connected` only acts in `Disconnected`, so any number of
//! calls yields one connect attempt. Subscribe and unsubscribe requests
//! made while `Connecting` are queued and flushed exactly once, in
//! order, when the socket opens. Nothing reconnects automatically.
//!
//! The manager is driven by the relay event loop: it spawns the connect
//! task, and that task reports back through [`UpstreamEvent`]s stamped
//! with a generation number so events from a superseded attempt are
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::application::ports::{
    LinkEvent, UpstreamCommand, UpstreamConnectionError, UpstreamConnector, UpstreamLink,
};
use crate::domain::credentials::BearerToken;
use crate::domain::streaming::DecodedTick;
use crate::infrastructure::fyers::codec::{DecodeError, TickCodec};

// =============================================================================
// Types
// =============================================================================

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    /// No socket, no attempt in flight.
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Socket open; control frames go straight out.
    Open,
}

/// Where the data socket lives and whose account it serves.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    /// Data socket base URL.
    pub socket_url: String,
    /// Provider application id, paired with the token in the URL.
    pub app_id: String,
}

impl UpstreamEndpoint {
    /// Socket URL authenticated with `token`.
    #[must_use]
    pub fn url_for(&self, token: &BearerToken) -> String {
        let separator = if self.socket_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}access_token={}:{}",
            self.socket_url,
            self.app_id,
            token.expose()
        )
    }
}

/// Event reported by a connect task.
#[derive(Debug)]
pub struct UpstreamEvent {
    /// Connect attempt this event belongs to.
    pub generation: u64,
    /// What happened.
    pub kind: UpstreamEventKind,
}

/// Payload of an [`UpstreamEvent`].
#[derive(Debug)]
pub enum UpstreamEventKind {
    /// The socket opened; control frames may be sent on this channel.
    Opened(mpsc::Sender<UpstreamCommand>),
    /// The socket never opened.
    ConnectFailed(UpstreamConnectionError),
    /// One binary frame.
    Frame(Vec<u8>),
    /// The socket closed.
    Closed {
        /// WebSocket close code, if any.
        code: Option<u16>,
        /// Close reason or error text.
        reason: String,
    },
    /// The adapter dropped its event channel without reporting a close.
    LinkEnded,
}

/// What the relay should do after an event.
#[derive(Debug)]
pub enum UpstreamOutcome {
    /// The socket opened and `flushed` queued requests went out.
    Opened {
        /// Deferred requests sent on open.
        flushed: usize,
    },
    /// A frame decoded; fan it out.
    Tick(DecodedTick),
    /// A frame failed to decode and was dropped.
    Malformed(DecodeError),
    /// The connection is gone; notify consumers.
    Lost(UpstreamConnectionError),
    /// Nothing to do.
    Ignored,
}

/// Result of a forward request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Sent to the open socket.
    Sent,
    /// Queued until the socket opens.
    Deferred,
    /// Not sent: disconnected, or the link refused it.
    Dropped,
}

enum Connection {
    Disconnected,
    Connecting { pending: Vec<UpstreamCommand> },
    Open { control: mpsc::Sender<UpstreamCommand> },
}

// =============================================================================
// Manager
// =============================================================================

/// Single-connection manager for the provider data socket.
pub struct UpstreamManager {
    connector: Arc<dyn UpstreamConnector>,
    endpoint: UpstreamEndpoint,
    connect_timeout: Duration,
    events: mpsc::Sender<UpstreamEvent>,
    codec: TickCodec,
    connection: Connection,
    generation: u64,
    token: Option<BearerToken>,
}

impl UpstreamManager {
    /// Create a disconnected manager. Connect tasks report on `events`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        endpoint: UpstreamEndpoint,
        connect_timeout: Duration,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            connect_timeout,
            events,
            codec: TickCodec::new(),
            connection: Connection::Disconnected,
            generation: 0,
            token: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> UpstreamState {
        match self.connection {
            Connection::Disconnected => UpstreamState::Disconnected,
            Connection::Connecting { .. } => UpstreamState::Connecting,
            Connection::Open { .. } => UpstreamState::Open,
        }
    }

    /// Token used for the current or most recent connection.
    #[must_use]
    pub const fn token(&self) -> Option<&BearerToken> {
        self.token.as_ref()
    }

    /// Start connecting with `token` if disconnected.
    ///
    /// Returns `true` if this call started an attempt; `false` (no-op)
    /// while connecting or open.
    pub fn ensure_connected(&mut self, token: &BearerToken) -> bool {
        if !matches!(self.connection, Connection::Disconnected) {
            return false;
        }

        self.generation += 1;
        self.connection = Connection::Connecting {
            pending: Vec::new(),
        };
        self.token = Some(token.clone());

        let generation = self.generation;
        let url = self.endpoint.url_for(token);
        tracing::info!(
            socket_url = %self.endpoint.socket_url,
            generation,
            "Connecting to Fyers data socket"
        );

        tokio::spawn(run_link(
            Arc::clone(&self.connector),
            url,
            self.connect_timeout,
            generation,
            self.events.clone(),
        ));
        true
    }

    /// Ask the provider to stream `instrument`.
    pub fn forward_subscribe(&mut self, instrument: &str) -> ForwardOutcome {
        self.forward(UpstreamCommand::Subscribe(instrument.to_string()))
    }

    /// Ask the provider to stop streaming `instrument`.
    pub fn forward_unsubscribe(&mut self, instrument: &str) -> ForwardOutcome {
        self.forward(UpstreamCommand::Unsubscribe(instrument.to_string()))
    }

    fn forward(&mut self, command: UpstreamCommand) -> ForwardOutcome {
        match &mut self.connection {
            Connection::Open { control } => send_control(control, command),
            Connection::Connecting { pending } => {
                tracing::debug!(?command, "Deferring control frame until open");
                pending.push(command);
                ForwardOutcome::Deferred
            }
            Connection::Disconnected => {
                tracing::debug!(?command, "Upstream disconnected, dropping control frame");
                ForwardOutcome::Dropped
            }
        }
    }

    /// Apply an event from a connect task.
    pub fn handle_event(&mut self, event: UpstreamEvent) -> UpstreamOutcome {
        if event.generation != self.generation {
            tracing::trace!(
                generation = event.generation,
                current = self.generation,
                "Ignoring event from superseded connection"
            );
            return UpstreamOutcome::Ignored;
        }

        match event.kind {
            UpstreamEventKind::Opened(control) => self.on_opened(control),
            UpstreamEventKind::ConnectFailed(error) => {
                if !matches!(self.connection, Connection::Connecting { .. }) {
                    return UpstreamOutcome::Ignored;
                }
                self.connection = Connection::Disconnected;
                UpstreamOutcome::Lost(error)
            }
            UpstreamEventKind::Frame(bytes) => {
                if !matches!(self.connection, Connection::Open { .. }) {
                    return UpstreamOutcome::Ignored;
                }
                match self.codec.decode(&bytes) {
                    Ok(decoded) => UpstreamOutcome::Tick(decoded),
                    Err(error) => UpstreamOutcome::Malformed(error),
                }
            }
            UpstreamEventKind::Closed { code, reason } => {
                self.on_lost(UpstreamConnectionError::Closed { code, reason })
            }
            UpstreamEventKind::LinkEnded => self.on_lost(UpstreamConnectionError::LinkClosed),
        }
    }

    fn on_lost(&mut self, error: UpstreamConnectionError) -> UpstreamOutcome {
        if matches!(self.connection, Connection::Disconnected) {
            return UpstreamOutcome::Ignored;
        }
        self.connection = Connection::Disconnected;
        UpstreamOutcome::Lost(error)
    }

    fn on_opened(&mut self, control: mpsc::Sender<UpstreamCommand>) -> UpstreamOutcome {
        let pending = match std::mem::replace(&mut self.connection, Connection::Disconnected) {
            Connection::Connecting { pending } => pending,
            other => {
                self.connection = other;
                return UpstreamOutcome::Ignored;
            }
        };

        let flushed = pending.len();
        for command in pending {
            send_control(&control, command);
        }
        self.connection = Connection::Open { control };

        tracing::info!(generation = self.generation, flushed, "Fyers data socket open");
        UpstreamOutcome::Opened { flushed }
    }
}

fn send_control(control: &mpsc::Sender<UpstreamCommand>, command: UpstreamCommand) -> ForwardOutcome {
    match control.try_send(command) {
        Ok(()) => ForwardOutcome::Sent,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to queue control frame");
            ForwardOutcome::Dropped
        }
    }
}

/// Open the socket, then relay its events stamped with `generation`.
async fn run_link(
    connector: Arc<dyn UpstreamConnector>,
    url: String,
    connect_timeout: Duration,
    generation: u64,
    events: mpsc::Sender<UpstreamEvent>,
) {
    let emit = |kind| UpstreamEvent { generation, kind };

    let link = match tokio::time::timeout(connect_timeout, connector.connect(&url)).await {
        Ok(Ok(link)) => link,
        Ok(Err(error)) => {
            let _ = events.send(emit(UpstreamEventKind::ConnectFailed(error))).await;
            return;
        }
        Err(_) => {
            let error = UpstreamConnectionError::Timeout(connect_timeout);
            let _ = events.send(emit(UpstreamEventKind::ConnectFailed(error))).await;
            return;
        }
    };

    let UpstreamLink {
        control,
        mut inbound,
    } = link;
    if events
        .send(emit(UpstreamEventKind::Opened(control)))
        .await
        .is_err()
    {
        return;
    }

    while let Some(event) = inbound.recv().await {
        let (kind, last) = match event {
            LinkEvent::Frame(bytes) => (UpstreamEventKind::Frame(bytes), false),
            LinkEvent::Closed { code, reason } => (UpstreamEventKind::Closed { code, reason }, true),
        };
        if events.send(emit(kind)).await.is_err() || last {
            return;
        }
    }

    let _ = events.send(emit(UpstreamEventKind::LinkEnded)).await;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::testing::FakeConnector;
    use crate::domain::streaming::Tick;

    const WAIT: Duration = Duration::from_secs(2);

    fn endpoint() -> UpstreamEndpoint {
        UpstreamEndpoint {
            socket_url: "wss://socket.example/data".to_string(),
            app_id: "APP-100".to_string(),
        }
    }

    fn token(value: &str) -> BearerToken {
        BearerToken::new(value).unwrap()
    }

    fn manager(
        connector: Arc<FakeConnector>,
    ) -> (UpstreamManager, mpsc::Receiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let manager = UpstreamManager::new(connector, endpoint(), Duration::from_secs(1), tx);
        (manager, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<UpstreamEvent>) -> UpstreamEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn url_carries_app_id_and_token() {
        assert_eq!(
            endpoint().url_for(&token("tok123")),
            "wss://socket.example/data?access_token=APP-100:tok123"
        );

        let with_query = UpstreamEndpoint {
            socket_url: "wss://socket.example/data?v=2".to_string(),
            ..endpoint()
        };
        assert!(with_query.url_for(&token("t")).ends_with("?v=2&access_token=APP-100:t"));
    }

    #[tokio::test]
    async fn repeated_ensure_connected_makes_one_attempt() {
        let (connector, gate, _links) = FakeConnector::gated();
        let (mut manager, _events) = manager(Arc::clone(&connector));

        let started: Vec<bool> = (0..10)
            .map(|_| manager.ensure_connected(&token("tok123")))
            .collect();

        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert_eq!(manager.state(), UpstreamState::Connecting);

        gate.notify_one();
        tokio::task::yield_now().await;
        timeout(WAIT, async {
            while connector.attempts() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn deferred_subscribe_sent_once_after_open() {
        let (connector, gate, mut links) = FakeConnector::gated();
        let (mut manager, mut events) = manager(connector);

        manager.ensure_connected(&token("tok123"));
        assert_eq!(manager.forward_subscribe("NSE:SBIN-EQ"), ForwardOutcome::Deferred);

        // Nothing has connected yet, so nothing can have been sent
        assert!(links.try_recv().is_err());

        gate.notify_one();
        let mut link = timeout(WAIT, links.recv()).await.unwrap().unwrap();
        assert!(link.url.ends_with("access_token=APP-100:tok123"));

        let outcome = manager.handle_event(next_event(&mut events).await);
        assert!(matches!(outcome, UpstreamOutcome::Opened { flushed: 1 }));
        assert_eq!(manager.state(), UpstreamState::Open);

        assert_eq!(
            link.control.recv().await.unwrap(),
            UpstreamCommand::Subscribe("NSE:SBIN-EQ".to_string())
        );
        assert_eq!(link.control.try_recv(), Err(TryRecvError::Empty));

        // Later requests go straight out, and the deferral never refires
        assert_eq!(manager.forward_subscribe("NSE:INFY-EQ"), ForwardOutcome::Sent);
        assert_eq!(
            link.control.recv().await.unwrap(),
            UpstreamCommand::Subscribe("NSE:INFY-EQ".to_string())
        );
        assert_eq!(link.control.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn deferred_requests_keep_order() {
        let (connector, mut links) = FakeConnector::new();
        let (mut manager, mut events) = manager(connector);

        manager.ensure_connected(&token("tok"));
        manager.forward_subscribe("A");
        manager.forward_unsubscribe("A");
        manager.forward_subscribe("B");

        manager.handle_event(next_event(&mut events).await);
        let mut link = links.recv().await.unwrap();

        assert_eq!(link.control.recv().await.unwrap(), UpstreamCommand::Subscribe("A".into()));
        assert_eq!(link.control.recv().await.unwrap(), UpstreamCommand::Unsubscribe("A".into()));
        assert_eq!(link.control.recv().await.unwrap(), UpstreamCommand::Subscribe("B".into()));
    }

    #[tokio::test]
    async fn forward_while_disconnected_is_dropped() {
        let (connector, _links) = FakeConnector::new();
        let (mut manager, _events) = manager(connector);

        assert_eq!(manager.forward_subscribe("NSE:SBIN-EQ"), ForwardOutcome::Dropped);
        assert_eq!(manager.state(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn frames_decode_while_open() {
        let (connector, mut links) = FakeConnector::new();
        let (mut manager, mut events) = manager(connector);
        manager.ensure_connected(&token("tok"));
        manager.handle_event(next_event(&mut events).await);
        let link = links.recv().await.unwrap();

        let tick = Tick {
            timestamp: 1_700_000_000_000,
            last_traded_price: 512.35,
            volume: 1200,
        };
        let frame = TickCodec::new().encode(&tick, None);
        link.events.send(LinkEvent::Frame(frame)).await.unwrap();
        link.events.send(LinkEvent::Frame(vec![0xff])).await.unwrap();

        match manager.handle_event(next_event(&mut events).await) {
            UpstreamOutcome::Tick(decoded) => assert_eq!(decoded.tick, tick),
            other => panic!("expected tick, got {other:?}"),
        }
        match manager.handle_event(next_event(&mut events).await) {
            UpstreamOutcome::Malformed(error) => assert_eq!(error.len, 1),
            other => panic!("expected decode error, got {other:?}"),
        }
        // A bad frame does not end the connection
        assert_eq!(manager.state(), UpstreamState::Open);
    }

    #[tokio::test]
    async fn close_returns_to_disconnected() {
        let (connector, mut links) = FakeConnector::new();
        let (mut manager, mut events) = manager(connector);
        manager.ensure_connected(&token("tok"));
        manager.handle_event(next_event(&mut events).await);
        let link = links.recv().await.unwrap();

        link.events
            .send(LinkEvent::Closed {
                code: Some(1006),
                reason: "abnormal".to_string(),
            })
            .await
            .unwrap();

        match manager.handle_event(next_event(&mut events).await) {
            UpstreamOutcome::Lost(UpstreamConnectionError::Closed { code, .. }) => {
                assert_eq!(code, Some(1006));
            }
            other => panic!("expected lost, got {other:?}"),
        }
        assert_eq!(manager.state(), UpstreamState::Disconnected);
        assert_eq!(manager.forward_subscribe("X"), ForwardOutcome::Dropped);

        // The next ensure_connected starts a fresh attempt
        assert!(manager.ensure_connected(&token("tok")));
    }

    #[tokio::test]
    async fn dropped_link_reports_link_closed() {
        let (connector, mut links) = FakeConnector::new();
        let (mut manager, mut events) = manager(connector);
        manager.ensure_connected(&token("tok"));
        manager.handle_event(next_event(&mut events).await);

        drop(links.recv().await.unwrap());

        let outcome = manager.handle_event(next_event(&mut events).await);
        assert!(matches!(
            outcome,
            UpstreamOutcome::Lost(UpstreamConnectionError::LinkClosed)
        ));
        assert_eq!(manager.state(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_is_lost() {
        let (connector, _links) =
            FakeConnector::failing(UpstreamConnectionError::Connect("refused".to_string()));
        let (mut manager, mut events) = manager(connector);

        manager.ensure_connected(&token("tok"));
        manager.forward_subscribe("NSE:SBIN-EQ");

        let outcome = manager.handle_event(next_event(&mut events).await);
        assert!(matches!(
            outcome,
            UpstreamOutcome::Lost(UpstreamConnectionError::Connect(_))
        ));
        assert_eq!(manager.state(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn connect_timeout_is_lost() {
        let (connector, _gate, _links) = FakeConnector::gated();
        let (tx, mut events) = mpsc::channel(8);
        let mut manager =
            UpstreamManager::new(connector, endpoint(), Duration::from_millis(20), tx);

        manager.ensure_connected(&token("tok"));

        let outcome = manager.handle_event(next_event(&mut events).await);
        assert!(matches!(
            outcome,
            UpstreamOutcome::Lost(UpstreamConnectionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn stale_generation_ignored() {
        let (connector, _links) = FakeConnector::new();
        let (mut manager, _events) = manager(connector);
        manager.ensure_connected(&token("tok"));

        let (control, _rx) = mpsc::channel(1);
        let outcome = manager.handle_event(UpstreamEvent {
            generation: 99,
            kind: UpstreamEventKind::Opened(control),
        });

        assert!(matches!(outcome, UpstreamOutcome::Ignored));
        assert_eq!(manager.state(), UpstreamState::Connecting);
    }
}
