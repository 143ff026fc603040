//! Relay Event Loop
//!
//! The single task that owns all mutable relay state: the upstream
//! manager, the consumer registry and the default bearer token. Consumer
//! sockets and the control plane talk to it through a [`RelayHandle`];
//! connect tasks talk to it through [`UpstreamEvent`]s. Everything is
//! applied in arrival order on one task, so nothing here takes a lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::fanout::{ConsumerOutbox, FanOut, UntaggedTickPolicy};
use super::status::RelayStatus;
use super::upstream::{
    UpstreamEndpoint, UpstreamEvent, UpstreamManager, UpstreamOutcome, UpstreamState,
};
use crate::application::ports::UpstreamConnector;
use crate::domain::credentials::BearerToken;
use crate::domain::streaming::{ConsumerCommand, Instrument, OutboundMessage};
use crate::domain::subscription::ConsumerId;
use crate::infrastructure::metrics;

// =============================================================================
// Commands
// =============================================================================

/// Request to the relay event loop.
#[derive(Debug)]
pub enum RelayCommand {
    /// A consumer socket opened.
    Connect {
        /// Consumer identifier.
        consumer: ConsumerId,
        /// Queue feeding the consumer's socket.
        outbox: ConsumerOutbox,
    },
    /// A consumer sent a subscribe or unsubscribe.
    Command {
        /// Consumer identifier.
        consumer: ConsumerId,
        /// Parsed command.
        command: ConsumerCommand,
    },
    /// A consumer socket closed.
    Disconnect {
        /// Consumer identifier.
        consumer: ConsumerId,
    },
    /// The control plane obtained a token.
    IssueToken(BearerToken),
}

/// The relay event loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("relay event loop is not running")]
pub struct RelayClosed;

/// Cloneable sender side of the relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Register a consumer.
    ///
    /// # Errors
    ///
    /// Returns `RelayClosed` if the event loop has stopped.
    pub async fn connect(
        &self,
        consumer: ConsumerId,
        outbox: ConsumerOutbox,
    ) -> Result<(), RelayClosed> {
        self.send(RelayCommand::Connect { consumer, outbox }).await
    }

    /// Apply a consumer command.
    ///
    /// # Errors
    ///
    /// Returns `RelayClosed` if the event loop has stopped.
    pub async fn dispatch(
        &self,
        consumer: ConsumerId,
        command: ConsumerCommand,
    ) -> Result<(), RelayClosed> {
        self.send(RelayCommand::Command { consumer, command }).await
    }

    /// Deregister a consumer.
    ///
    /// # Errors
    ///
    /// Returns `RelayClosed` if the event loop has stopped.
    pub async fn disconnect(&self, consumer: ConsumerId) -> Result<(), RelayClosed> {
        self.send(RelayCommand::Disconnect { consumer }).await
    }

    /// Hand a freshly issued token to the relay.
    ///
    /// # Errors
    ///
    /// Returns `RelayClosed` if the event loop has stopped.
    pub async fn issue_token(&self, token: BearerToken) -> Result<(), RelayClosed> {
        self.send(RelayCommand::IssueToken(token)).await
    }

    /// Whether the event loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: RelayCommand) -> Result<(), RelayClosed> {
        self.commands.send(command).await.map_err(|_| RelayClosed)
    }
}

// =============================================================================
// Options
// =============================================================================

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upstream socket location.
    pub endpoint: UpstreamEndpoint,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Capacity of the command queue.
    pub command_buffer: usize,
    /// Capacity of the upstream event queue.
    pub upstream_event_buffer: usize,
    /// Routing for ticks without an instrument.
    pub untagged_ticks: UntaggedTickPolicy,
}

// =============================================================================
// Relay
// =============================================================================

/// The relay event loop.
pub struct Relay {
    commands: mpsc::Receiver<RelayCommand>,
    upstream_events: mpsc::Receiver<UpstreamEvent>,
    upstream: UpstreamManager,
    fanout: FanOut,
    default_token: Option<BearerToken>,
    status: Arc<RelayStatus>,
}

impl Relay {
    /// Build the loop and its handle. Nothing runs until [`Relay::run`].
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        options: RelayOptions,
        status: Arc<RelayStatus>,
    ) -> (Self, RelayHandle) {
        let (command_tx, command_rx) = mpsc::channel(options.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(options.upstream_event_buffer.max(1));

        let relay = Self {
            commands: command_rx,
            upstream_events: event_rx,
            upstream: UpstreamManager::new(
                connector,
                options.endpoint,
                options.connect_timeout,
                event_tx,
            ),
            fanout: FanOut::new(options.untagged_ticks),
            default_token: None,
            status,
        };
        (
            relay,
            RelayHandle {
                commands: command_tx,
            },
        )
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Relay event loop started");
        metrics::set_upstream_connected(false);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Relay event loop cancelled");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("All relay handles dropped");
                        break;
                    };
                    self.handle_command(command);
                }
                Some(event) = self.upstream_events.recv() => {
                    let outcome = self.upstream.handle_event(event);
                    self.handle_outcome(outcome);
                }
            }
        }
    }

    fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Connect { consumer, outbox } => {
                if self.fanout.add_consumer(consumer, outbox) {
                    tracing::debug!(consumer, "Consumer connected");
                } else {
                    tracing::warn!(consumer, "Duplicate consumer id, keeping existing");
                }
            }
            RelayCommand::Command {
                consumer,
                command: ConsumerCommand::Subscribe {
                    instrument,
                    access_token,
                },
            } => self.subscribe(consumer, instrument, access_token),
            RelayCommand::Command {
                consumer,
                command: ConsumerCommand::Unsubscribe { instrument },
            } => {
                if self.fanout.record_unsubscription(consumer, &instrument) {
                    tracing::info!(instrument = %instrument, "Last subscriber left, unsubscribing upstream");
                    self.upstream.forward_unsubscribe(&instrument);
                }
            }
            RelayCommand::Disconnect { consumer } => {
                for instrument in self.fanout.remove_consumer(consumer) {
                    tracing::info!(instrument = %instrument, "Last subscriber left, unsubscribing upstream");
                    self.upstream.forward_unsubscribe(&instrument);
                }
                tracing::debug!(consumer, "Consumer disconnected");
            }
            RelayCommand::IssueToken(token) => {
                tracing::info!("Bearer token issued");
                self.default_token = Some(token);
            }
        }
        self.publish_counts();
    }

    fn subscribe(
        &mut self,
        consumer: ConsumerId,
        instrument: Instrument,
        access_token: Option<String>,
    ) {
        if !self.fanout.contains(consumer) {
            tracing::debug!(consumer, "Subscribe from unknown consumer ignored");
            return;
        }
        if let Some(token) = access_token.and_then(BearerToken::new) {
            self.default_token = Some(token);
        }

        if self.upstream.state() == UpstreamState::Disconnected {
            let Some(token) = &self.default_token else {
                tracing::info!(consumer, instrument = %instrument, "Subscribe without access token");
                self.fanout.send_to(consumer, &OutboundMessage::token_required());
                return;
            };
            if self.upstream.ensure_connected(token) {
                self.status.set_connecting();
            }
        }

        if self.fanout.record_subscription(consumer, &instrument) {
            tracing::info!(instrument = %instrument, "Forwarding subscribe upstream");
            self.upstream.forward_subscribe(&instrument);
        }
    }

    fn handle_outcome(&mut self, outcome: UpstreamOutcome) {
        match outcome {
            UpstreamOutcome::Opened { flushed } => {
                tracing::debug!(flushed, "Deferred control frames flushed");
                self.status.set_open();
                metrics::record_upstream_connect(metrics::ConnectOutcome::Opened);
                metrics::set_upstream_connected(true);
            }
            UpstreamOutcome::Tick(decoded) => {
                let started = Instant::now();
                let delivery = self.fanout.broadcast(&decoded);
                metrics::record_fanout_duration(started.elapsed());
                metrics::record_frame_received();
                metrics::record_messages_sent(delivery.delivered);
                self.status.record_frame();
            }
            UpstreamOutcome::Malformed(error) => {
                tracing::warn!(error = %error, "Dropping malformed upstream frame");
                metrics::record_decode_error();
                self.status.record_decode_error();
            }
            UpstreamOutcome::Lost(error) => {
                let was_open = self.status.state() == UpstreamState::Open;
                tracing::warn!(error = %error, "Fyers connection lost");

                let delivery = self.fanout.broadcast_event(&OutboundMessage::upstream_lost());
                self.fanout.clear_subscriptions();
                self.status.set_disconnected(Some(error.to_string()));

                if !was_open {
                    metrics::record_upstream_connect(metrics::ConnectOutcome::Failed);
                }
                metrics::record_upstream_lost();
                metrics::record_messages_sent(delivery.delivered);
                metrics::set_upstream_connected(false);
                self.publish_counts();
            }
            UpstreamOutcome::Ignored => {}
        }
    }

    fn publish_counts(&self) {
        let consumers = self.fanout.consumer_count();
        let instruments = self.fanout.stats().instrument_count;
        self.status.set_counts(consumers, instruments);
        metrics::set_fanout_counts(consumers, instruments);
    }
}

// =============================================================================
// Tests
// =============================================================================
