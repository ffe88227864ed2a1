//! Per-key expiry scheduling for room invites.
//!
//! [`ExpiryTimer`] is a small deadline table, not a background task: the
//! session loop asks for [`next_deadline`](ExpiryTimer::next_deadline) to arm
//! its `tokio::select!` sleep, then drains the keys whose deadline passed.
//! Because the table is owned by the loop, teardown is structural — dropping
//! the loop drops every pending expiry with it.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks at most one pending expiry deadline per key.
///
/// Re-arming an existing key resets its countdown.
#[derive(Debug, Default)]
pub struct ExpiryTimer<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> ExpiryTimer<K> {
    /// Create an empty timer table.
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Arm (or re-arm) `key` to expire `after` from now.
    pub fn arm(&mut self, key: K, after: Duration) {
        self.arm_at(key, Instant::now() + after);
    }

    /// Arm (or re-arm) `key` with an explicit deadline.
    pub fn arm_at(&mut self, key: K, deadline: Instant) {
        self.deadlines.insert(key, deadline);
    }

    /// Cancel the pending expiry for `key`. Returns `true` if one was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Returns `true` if `key` currently has a pending expiry.
    pub fn is_armed(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }

    /// Drop every pending expiry.
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Number of pending expiries.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Returns `true` if no expiry is pending.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn arm_and_drain() {
        let mut timer = ExpiryTimer::new();
        let now = Instant::now();
        timer.arm_at("a", now + Duration::from_millis(10));
        timer.arm_at("b", now + Duration::from_millis(50));

        assert_eq!(timer.next_deadline(), Some(now + Duration::from_millis(10)));

        let expired = timer.drain_expired(now + Duration::from_millis(20));
        assert_eq!(expired, vec!["a"]);
        assert!(timer.is_armed(&"b"));
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn rearming_resets_the_countdown() {
        let mut timer = ExpiryTimer::new();
        let now = Instant::now();
        timer.arm_at("a", now + Duration::from_millis(10));
        timer.arm_at("a", now + Duration::from_millis(100));

        // Only one pending expiry per key, with the later deadline.
        assert_eq!(timer.len(), 1);
        assert!(timer.drain_expired(now + Duration::from_millis(20)).is_empty());
        assert_eq!(
            timer.drain_expired(now + Duration::from_millis(100)),
            vec!["a"]
        );
    }

    #[test]
    fn cancel_removes_pending_expiry() {
        let mut timer = ExpiryTimer::new();
        timer.arm("a", Duration::from_secs(10));
        assert!(timer.cancel(&"a"));
        assert!(!timer.cancel(&"a"));
        assert!(timer.is_empty());
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn clear_drops_everything() {
        let mut timer = ExpiryTimer::new();
        timer.arm("a", Duration::from_secs(1));
        timer.arm("b", Duration::from_secs(2));
        timer.clear();
        assert!(timer.is_empty());
    }
}
