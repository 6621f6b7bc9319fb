use std::collections::{BTreeSet, HashSet, VecDeque};

use super::SubscriptionKey;

/// Per-adapter subscription bookkeeping.
///
/// `desired` survives reconnects; `active` and the pending queue are
/// per-connection. A key is either active, pending, or neither, never both.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    desired: BTreeSet<SubscriptionKey>,
    active: HashSet<SubscriptionKey>,
    pending: HashSet<SubscriptionKey>,
    pending_q: VecDeque<SubscriptionKey>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest in `key`, queueing it unless already active or pending.
    /// Returns true if the key was queued.
    pub fn request(&mut self, key: SubscriptionKey) -> bool {
        self.desired.insert(key.clone());
        self.enqueue(key)
    }

    fn enqueue(&mut self, key: SubscriptionKey) -> bool {
        if self.active.contains(&key) || self.pending.contains(&key) {
            return false;
        }
        self.pending.insert(key.clone());
        self.pending_q.push_back(key);
        true
    }

    /// Drop interest in `key`. Returns true if it was active on the current
    /// connection and needs an explicit unsubscribe.
    pub fn remove(&mut self, key: &SubscriptionKey) -> bool {
        self.desired.remove(key);
        if self.pending.remove(key) {
            self.pending_q.retain(|k| k != key);
        }
        self.active.remove(key)
    }

    /// Pop up to `max` queued keys for the next subscribe request
    pub fn take_pending(&mut self, max: usize) -> Vec<SubscriptionKey> {
        let mut batch = Vec::with_capacity(max.min(self.pending_q.len()));
        while batch.len() < max {
            let Some(key) = self.pending_q.pop_front() else {
                break;
            };
            self.pending.remove(&key);
            if self.desired.contains(&key) {
                batch.push(key);
            }
        }
        batch
    }

    pub fn mark_sent(&mut self, keys: &[SubscriptionKey]) {
        for key in keys {
            if self.desired.contains(key) {
                self.active.insert(key.clone());
            }
        }
    }

    /// Put keys from a failed send back at the front of the queue
    pub fn mark_failed(&mut self, keys: Vec<SubscriptionKey>) {
        for key in keys.into_iter().rev() {
            if self.desired.contains(&key) && !self.active.contains(&key) && self.pending.insert(key.clone()) {
                self.pending_q.push_front(key);
            }
        }
    }

    /// The venue refused keys it had been sent. They stay desired but
    /// inactive until the next connection queues them again.
    pub fn mark_rejected(&mut self, keys: &[SubscriptionKey]) {
        for key in keys {
            self.active.remove(key);
        }
    }

    /// Connection lost: nothing is active any more and every desired key is
    /// queued exactly once for the next connection.
    pub fn on_disconnect(&mut self) {
        self.active.clear();
        self.pending.clear();
        self.pending_q.clear();
        let desired: Vec<SubscriptionKey> = self.desired.iter().cloned().collect();
        for key in desired {
            self.enqueue(key);
        }
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.active.contains(key)
    }

    pub fn desired_len(&self) -> usize {
        self.desired.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_q.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn key(symbol: &str, timeframe: Timeframe) -> SubscriptionKey {
        SubscriptionKey::new(symbol, timeframe)
    }

    #[test]
    fn test_request_is_deduplicated() {
        let mut subs = SubscriptionSet::new();
        assert!(subs.request(key("BTCUSDT", Timeframe::H1)));
        assert!(!subs.request(key("BTCUSDT", Timeframe::H1)));
        assert_eq!(subs.pending_len(), 1);

        let batch = subs.take_pending(10);
        subs.mark_sent(&batch);
        assert!(!subs.request(key("BTCUSDT", Timeframe::H1)));
        assert_eq!(subs.pending_len(), 0);
        assert_eq!(subs.active_len(), 1);
    }

    #[test]
    fn test_reconnect_resends_each_subscription_once() {
        let mut subs = SubscriptionSet::new();
        subs.request(key("BTCUSDT", Timeframe::H1));
        subs.request(key("ETHUSDT", Timeframe::H1));
        subs.request(key("BTCUSDT", Timeframe::D1));

        let first = subs.take_pending(10);
        assert_eq!(first.len(), 3);
        subs.mark_sent(&first);

        subs.on_disconnect();
        assert_eq!(subs.active_len(), 0);
        assert_eq!(subs.pending_len(), 3);

        let resent = subs.take_pending(10);
        assert_eq!(resent.len(), 3);
        let unique: HashSet<_> = resent.iter().cloned().collect();
        assert_eq!(unique.len(), 3);
        subs.mark_sent(&resent);
        assert!(subs.take_pending(10).is_empty());

        // A second disconnect before anything is sent still yields one copy each
        subs.on_disconnect();
        subs.on_disconnect();
        assert_eq!(subs.pending_len(), 3);
    }

    #[test]
    fn test_batches_respect_limit() {
        let mut subs = SubscriptionSet::new();
        for tf in Timeframe::ALL {
            subs.request(key("BTCUSDT", tf));
        }
        assert_eq!(subs.take_pending(4).len(), 4);
        assert_eq!(subs.take_pending(4).len(), 2);
        assert!(subs.take_pending(4).is_empty());
    }

    #[test]
    fn test_remove_reports_active_and_drops_pending() {
        let mut subs = SubscriptionSet::new();
        let btc = key("BTCUSDT", Timeframe::H1);
        let eth = key("ETHUSDT", Timeframe::H1);
        subs.request(btc.clone());
        subs.request(eth.clone());

        let sent = subs.take_pending(1);
        subs.mark_sent(&sent);
        assert!(subs.is_active(&btc));

        assert!(subs.remove(&btc));
        assert!(!subs.remove(&eth));
        assert!(subs.take_pending(10).is_empty());
        assert_eq!(subs.desired_len(), 0);
    }

    #[test]
    fn test_failed_send_is_retried_first() {
        let mut subs = SubscriptionSet::new();
        subs.request(key("BTCUSDT", Timeframe::H1));
        subs.request(key("ETHUSDT", Timeframe::H1));
        subs.request(key("SOLUSDT", Timeframe::H1));

        let batch = subs.take_pending(2);
        subs.mark_failed(batch.clone());
        assert_eq!(subs.pending_len(), 3);
        assert_eq!(subs.take_pending(2), batch);
    }

    #[test]
    fn test_rejected_keys_return_on_reconnect() {
        let mut subs = SubscriptionSet::new();
        let btc = key("BTCUSDT", Timeframe::H1);
        let bad = key("FOOUSDT", Timeframe::H1);
        subs.request(btc.clone());
        subs.request(bad.clone());
        let batch = subs.take_pending(10);
        subs.mark_sent(&batch);

        subs.mark_rejected(std::slice::from_ref(&bad));
        assert!(!subs.is_active(&bad));
        assert!(subs.is_active(&btc));
        // Not re-sent on the same connection
        assert_eq!(subs.pending_len(), 0);

        subs.on_disconnect();
        let resent = subs.take_pending(10);
        assert_eq!(resent.len(), 2);
        assert!(resent.contains(&bad));
    }
}
