//! Subscriber Registry and Fan-out
//!
//! Holds one outbound queue per downstream consumer plus the
//! subscription book, and delivers envelopes to them.
//!
//! Delivery is fire-and-forget: every envelope is serialized once, then
//! offered to each recipient's queue with `try_send`. A full or closed
//! queue is skipped and counted, never propagated.
//!
//! # Routing
//!
//! - A tick that names its instrument goes only to consumers subscribed
//!   to exactly that instrument.
//! - A tick without an instrument follows [`UntaggedTickPolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::streaming::{DecodedTick, Instrument, OutboundMessage};
use crate::domain::subscription::{ConsumerId, SubscriptionBook, SubscriptionStats};
use crate::infrastructure::metrics;

/// Queue feeding one consumer's socket writer. Payloads are JSON text.
pub type ConsumerOutbox = mpsc::Sender<Arc<str>>;

/// Routing for ticks whose frame carried no instrument.
///
/// The base three-field schema has no symbol, so such a tick cannot be
/// matched against a consumer's instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UntaggedTickPolicy {
    /// Send to every consumer holding at least one subscription.
    #[default]
    Broadcast,
    /// Discard.
    Drop,
}

impl UntaggedTickPolicy {
    /// Parse `broadcast` or `drop`, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "broadcast" => Some(Self::Broadcast),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }

    /// Setting name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Drop => "drop",
        }
    }
}

/// Result of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Consumers whose queue accepted the envelope.
    pub delivered: usize,
    /// Consumers skipped because their queue was full or closed.
    pub skipped: usize,
}

/// Registry of consumers and their subscriptions.
#[derive(Debug)]
pub struct FanOut {
    outboxes: HashMap<ConsumerId, ConsumerOutbox>,
    book: SubscriptionBook,
    untagged: UntaggedTickPolicy,
}

impl FanOut {
    /// Create an empty registry.
    #[must_use]
    pub fn new(untagged: UntaggedTickPolicy) -> Self {
        Self {
            outboxes: HashMap::new(),
            book: SubscriptionBook::new(),
            untagged,
        }
    }

    /// Register a consumer. Returns `false` if the id is already taken,
    /// in which case the existing registration is kept.
    pub fn add_consumer(&mut self, consumer: ConsumerId, outbox: ConsumerOutbox) -> bool {
        if self.outboxes.contains_key(&consumer) {
            return false;
        }
        self.outboxes.insert(consumer, outbox);
        true
    }

    /// Deregister a consumer and drop its subscriptions.
    ///
    /// Returns instruments no remaining consumer holds. Idempotent.
    pub fn remove_consumer(&mut self, consumer: ConsumerId) -> Vec<Instrument> {
        self.outboxes.remove(&consumer);
        self.book.remove_consumer(consumer)
    }

    /// Whether `consumer` is registered.
    #[must_use]
    pub fn contains(&self, consumer: ConsumerId) -> bool {
        self.outboxes.contains_key(&consumer)
    }

    /// Record a subscription. Returns `true` on first interest in the
    /// instrument. Unregistered consumers are ignored.
    pub fn record_subscription(&mut self, consumer: ConsumerId, instrument: &str) -> bool {
        self.contains(consumer) && self.book.add(consumer, instrument)
    }

    /// Record an unsubscription. Returns `true` when the last interest in
    /// the instrument went away.
    pub fn record_unsubscription(&mut self, consumer: ConsumerId, instrument: &str) -> bool {
        self.book.remove(consumer, instrument)
    }

    /// Forget every subscription while keeping consumers registered.
    pub fn clear_subscriptions(&mut self) {
        self.book.clear();
    }

    /// Deliver a tick to the consumers that should see it.
    pub fn broadcast(&self, decoded: &DecodedTick) -> Delivery {
        let recipients: Vec<ConsumerId> = match (&decoded.instrument, self.untagged) {
            (Some(instrument), _) => self
                .outboxes
                .keys()
                .copied()
                .filter(|id| self.book.is_subscribed(*id, instrument))
                .collect(),
            (None, UntaggedTickPolicy::Broadcast) => self
                .outboxes
                .keys()
                .copied()
                .filter(|id| self.book.has_subscriptions(*id))
                .collect(),
            (None, UntaggedTickPolicy::Drop) => {
                tracing::trace!("Dropping tick without instrument");
                return Delivery::default();
            }
        };

        if recipients.is_empty() {
            return Delivery::default();
        }

        self.deliver_all(
            recipients.into_iter(),
            &OutboundMessage::tick(decoded.tick),
        )
    }

    /// Deliver an envelope to every registered consumer.
    pub fn broadcast_event(&self, message: &OutboundMessage) -> Delivery {
        self.deliver_all(self.outboxes.keys().copied(), message)
    }

    /// Deliver an envelope to one consumer. Returns `false` if it was
    /// skipped.
    pub fn send_to(&self, consumer: ConsumerId, message: &OutboundMessage) -> bool {
        self.deliver_all(std::iter::once(consumer), message).delivered == 1
    }

    /// Number of registered consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Subscription statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.book.stats()
    }

    fn deliver_all(
        &self,
        recipients: impl Iterator<Item = ConsumerId>,
        message: &OutboundMessage,
    ) -> Delivery {
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize outbound message");
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        for consumer in recipients {
            let Some(outbox) = self.outboxes.get(&consumer) else {
                continue;
            };
            match outbox.try_send(Arc::clone(&payload)) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(consumer, "Consumer queue full, dropping message");
                    metrics::record_message_dropped(metrics::DropReason::QueueFull);
                    delivery.skipped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    metrics::record_message_dropped(metrics::DropReason::ConsumerGone);
                    delivery.skipped += 1;
                }
            }
        }
        delivery
    }
}

// =============================================================================
// Tests
// =============================================================================
