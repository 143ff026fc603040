//! Subscription Book
//!
//! Tracks which instruments each consumer has subscribed to and how many
//! consumers share each instrument.
//!
//! # Design
//!
//! The book tracks:
//! - Which instruments each consumer is subscribed to
//! - Reference counting for upstream subscriptions
//!
//! This allows multiple consumers to subscribe to the same instrument
//! while the relay sends only one upstream subscribe for it. The book is
//! owned by the relay event loop and is never shared, so it carries no
//! locks.

use std::collections::{HashMap, HashSet};

use crate::domain::streaming::Instrument;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream consumer connection.
pub type ConsumerId = u64;

// =============================================================================
// Subscription Book
// =============================================================================

/// Per-consumer instrument sets plus per-instrument reference counts.
///
/// # Example
///
/// ```rust
/// use fyers_stream_relay::domain::subscription::SubscriptionBook;
///
/// let mut book = SubscriptionBook::new();
///
/// // Consumer 1 subscribes - first interest, forward upstream
/// assert!(book.add(1, "NSE:SBIN-EQ"));
///
/// // Consumer 2 also subscribes - no upstream change needed
/// assert!(!book.add(2, "NSE:SBIN-EQ"));
///
/// // Consumer 1 unsubscribes - still held by consumer 2
/// assert!(!book.remove(1, "NSE:SBIN-EQ"));
///
/// // Consumer 2 leaves - now unsubscribe upstream
/// assert_eq!(book.remove_consumer(2), vec!["NSE:SBIN-EQ".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    /// Map from consumer ID to their subscribed instruments.
    consumer_instruments: HashMap<ConsumerId, HashSet<Instrument>>,
    /// Map from instrument to reference count.
    instrument_refcount: HashMap<Instrument, usize>,
}

impl SubscriptionBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `consumer` wants `instrument`.
    ///
    /// Returns `true` when this is the first interest in the instrument
    /// (refcount went 0→1) and an upstream subscribe is needed.
    pub fn add(&mut self, consumer: ConsumerId, instrument: &str) -> bool {
        let instruments = self.consumer_instruments.entry(consumer).or_default();
        if !instruments.insert(instrument.to_string()) {
            return false;
        }

        let refcount = self
            .instrument_refcount
            .entry(instrument.to_string())
            .or_insert(0);
        *refcount += 1;
        *refcount == 1
    }

    /// Record that `consumer` no longer wants `instrument`.
    ///
    /// Returns `true` when the last interest was removed (refcount went
    /// 1→0) and an upstream unsubscribe is needed.
    pub fn remove(&mut self, consumer: ConsumerId, instrument: &str) -> bool {
        let Some(instruments) = self.consumer_instruments.get_mut(&consumer) else {
            return false;
        };
        if !instruments.remove(instrument) {
            return false;
        }
        if instruments.is_empty() {
            self.consumer_instruments.remove(&consumer);
        }

        self.release(instrument)
    }

    /// Remove every subscription held by `consumer`.
    ///
    /// Returns the instruments nobody else holds, sorted. Unknown
    /// consumers yield an empty list.
    pub fn remove_consumer(&mut self, consumer: ConsumerId) -> Vec<Instrument> {
        let Some(instruments) = self.consumer_instruments.remove(&consumer) else {
            return vec![];
        };

        let mut released: Vec<_> = instruments
            .into_iter()
            .filter(|instrument| self.release(instrument))
            .collect();
        released.sort();
        released
    }

    /// Drop all subscriptions for all consumers.
    pub fn clear(&mut self) {
        self.consumer_instruments.clear();
        self.instrument_refcount.clear();
    }

    /// Whether `consumer` currently lists `instrument`.
    #[must_use]
    pub fn is_subscribed(&self, consumer: ConsumerId, instrument: &str) -> bool {
        self.consumer_instruments
            .get(&consumer)
            .is_some_and(|set| set.contains(instrument))
    }

    /// Whether `consumer` holds at least one subscription.
    #[must_use]
    pub fn has_subscriptions(&self, consumer: ConsumerId) -> bool {
        self.consumer_instruments.contains_key(&consumer)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            instrument_count: self.instrument_refcount.len(),
            consumer_count: self.consumer_instruments.len(),
        }
    }

    /// Decrement the refcount. Returns `true` if it reached zero.
    fn release(&mut self, instrument: &str) -> bool {
        let Some(refcount) = self.instrument_refcount.get_mut(instrument) else {
            return false;
        };
        *refcount = refcount.saturating_sub(1);
        if *refcount == 0 {
            self.instrument_refcount.remove(instrument);
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of unique instruments.
    pub instrument_count: usize,
    /// Number of consumers holding at least one subscription.
    pub consumer_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SBIN: &str = "NSE:SBIN-EQ";
    const INFY: &str = "NSE:INFY-EQ";

    #[test]
    fn add_new_instrument_needs_upstream() {
        let mut book = SubscriptionBook::new();
        assert!(book.add(1, SBIN));
        assert!(book.is_subscribed(1, SBIN));
    }

    #[test]
    fn add_existing_instrument_no_upstream() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);

        // Second consumer - no upstream change needed
        assert!(!book.add(2, SBIN));
    }

    #[test]
    fn add_duplicate_for_same_consumer() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);

        assert!(!book.add(1, SBIN));
        assert_eq!(book.stats().instrument_count, 1);
    }

    #[test]
    fn remove_with_remaining_consumers() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);
        book.add(2, SBIN);

        assert!(!book.remove(1, SBIN));
        assert!(book.is_subscribed(2, SBIN));
    }

    #[test]
    fn remove_last_consumer() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);

        assert!(book.remove(1, SBIN));
        assert!(!book.has_subscriptions(1));
    }

    #[test]
    fn remove_nonexistent_subscription_no_changes() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);

        assert!(!book.remove(1, INFY));
        assert!(!book.remove(7, SBIN));
        assert!(book.is_subscribed(1, SBIN));
    }

    #[test]
    fn remove_consumer_releases_unshared_instruments() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);
        book.add(1, INFY);
        book.add(2, SBIN);

        let released = book.remove_consumer(1);

        // SBIN is still held by consumer 2
        assert_eq!(released, vec![INFY.to_string()]);
        assert!(book.is_subscribed(2, SBIN));
    }

    #[test]
    fn remove_consumer_is_idempotent() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);

        assert_eq!(book.remove_consumer(1), vec![SBIN.to_string()]);
        assert!(book.remove_consumer(1).is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);
        book.add(2, INFY);

        book.clear();

        assert_eq!(book.stats(), SubscriptionStats::default());
        assert!(!book.is_subscribed(2, INFY));
        // A fresh subscribe after clearing counts as first interest again
        assert!(book.add(1, SBIN));
    }

    #[test]
    fn subscription_queries() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);
        book.add(1, INFY);

        assert!(book.is_subscribed(1, SBIN));
        assert!(book.is_subscribed(1, INFY));
        assert!(book.has_subscriptions(1));
        assert!(!book.is_subscribed(99, SBIN));
        assert!(!book.has_subscriptions(99));
    }

    #[test]
    fn stats_are_accurate() {
        let mut book = SubscriptionBook::new();
        book.add(1, SBIN);
        book.add(2, SBIN);
        book.add(2, INFY);

        let stats = book.stats();
        assert_eq!(stats.instrument_count, 2);
        assert_eq!(stats.consumer_count, 2);
    }
}
