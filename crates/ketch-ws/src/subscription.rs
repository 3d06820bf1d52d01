//! Subscription tracking for one connection.
//!
//! A duplicate-free set of channel identifiers with deterministic
//! (insertion) iteration order, so restoration after a reconnect replays
//! the exact subscribe sequence.

use ketch_telemetry::metrics::SUBSCRIPTIONS_ACTIVE;
use parking_lot::RwLock;

/// Active channel set for one connection.
pub struct SubscriptionManager {
    channels: RwLock<Vec<String>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Record a confirmed subscription. Returns false for duplicates.
    pub fn add(&self, channel: &str) -> bool {
        let mut channels = self.channels.write();
        if channels.iter().any(|c| c == channel) {
            return false;
        }
        channels.push(channel.to_string());
        SUBSCRIPTIONS_ACTIVE.inc();
        true
    }

    /// Remove a confirmed unsubscription. Returns false when absent.
    pub fn remove(&self, channel: &str) -> bool {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|c| c != channel);
        let removed = channels.len() < before;
        if removed {
            SUBSCRIPTIONS_ACTIVE.dec();
        }
        removed
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.read().iter().any(|c| c == channel)
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Channels in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.channels.read().clone()
    }

    /// Drop all channels (terminal close).
    pub fn clear(&self) {
        let mut channels = self.channels.write();
        SUBSCRIPTIONS_ACTIVE.sub(channels.len() as i64);
        channels.clear();
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_deduplicates() {
        let subs = SubscriptionManager::new();
        assert!(subs.add("trades.BTC"));
        assert!(!subs.add("trades.BTC"));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let subs = SubscriptionManager::new();
        subs.add("trades.BTC");
        subs.add("book.ETH");
        subs.add("ticker.SOL");
        assert_eq!(
            subs.snapshot(),
            vec!["trades.BTC", "book.ETH", "ticker.SOL"]
        );
    }

    #[test]
    fn test_remove() {
        let subs = SubscriptionManager::new();
        subs.add("trades.BTC");
        subs.add("book.ETH");

        assert!(subs.remove("trades.BTC"));
        assert!(!subs.remove("trades.BTC"));
        assert!(subs.contains("book.ETH"));
        assert_eq!(subs.snapshot(), vec!["book.ETH"]);
    }

    #[test]
    fn test_clear() {
        let subs = SubscriptionManager::new();
        subs.add("a");
        subs.add("b");
        subs.clear();
        assert!(subs.is_empty());
    }
}
