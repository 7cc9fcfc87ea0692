//! In-process connection tracking.
//!
//! Three concerns share this singleton: deduplication of sockets already in
//! the upgrade pipeline, squelching of rapid duplicate upgrades from the
//! same (URL, client) pair, and the cleanup-once guard that absorbs
//! overlapping close/error events. Socket identity is the peer address;
//! entries are dropped on the socket's close/error, never by collection.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use uuid::Uuid;

/// Window within which a second upgrade for the same (URL, client) is a
/// duplicate.
pub const DUPLICATE_WINDOW: Duration = Duration::from_millis(1000);
/// Age after which duplicate-squelch entries are pruned.
const DUPLICATE_RETENTION: Duration = Duration::from_secs(10);
/// How long a connection id stays in the cleanup-once set.
const CLEANUP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    in_flight: Mutex<HashSet<SocketAddr>>,
    recent_upgrades: Mutex<HashMap<(String, String), Instant>>,
    cleaned: Mutex<HashMap<Uuid, Instant>>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a socket as mid-upgrade. Returns `false` if it already was.
    ///
    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    pub fn mark_in_flight(&self, peer: SocketAddr) -> bool {
        self.in_flight.lock().unwrap().insert(peer)
    }

    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    pub fn unmark_in_flight(&self, peer: SocketAddr) {
        self.in_flight.lock().unwrap().remove(&peer);
    }

    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    #[must_use]
    pub fn is_in_flight(&self, peer: SocketAddr) -> bool {
        self.in_flight.lock().unwrap().contains(&peer)
    }

    /// Records an upgrade for (URL, client identity) and reports whether it
    /// duplicates one seen within [`DUPLICATE_WINDOW`].
    ///
    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    pub fn is_rapid_duplicate(&self, url: &str, identity: &str) -> bool {
        self.is_rapid_duplicate_at(url, identity, Instant::now())
    }

    pub(crate) fn is_rapid_duplicate_at(&self, url: &str, identity: &str, now: Instant) -> bool {
        let mut recent = self.recent_upgrades.lock().unwrap();
        let key = (url.to_string(), identity.to_string());
        let duplicate = recent
            .get(&key)
            .is_some_and(|last| now.saturating_duration_since(*last) < DUPLICATE_WINDOW);
        recent.insert(key, now);
        if duplicate {
            log::debug!("squelched rapid duplicate upgrade for {identity} on {url}");
        }
        duplicate
    }

    /// Marks a connection's cleanup as executed. Returns `true` only on the
    /// first call per id within the grace period.
    ///
    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    pub fn mark_cleaned(&self, id: Uuid) -> bool {
        self.mark_cleaned_at(id, Instant::now())
    }

    pub(crate) fn mark_cleaned_at(&self, id: Uuid, now: Instant) -> bool {
        self.cleaned.lock().unwrap().insert(id, now).is_none()
    }

    /// Prunes expired duplicate-squelch and cleanup-once entries.
    ///
    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub(crate) fn sweep_at(&self, now: Instant) {
        self.recent_upgrades
            .lock()
            .unwrap()
            .retain(|_, last| now.saturating_duration_since(*last) < DUPLICATE_RETENTION);
        self.cleaned
            .lock()
            .unwrap()
            .retain(|_, marked| now.saturating_duration_since(*marked) < CLEANUP_GRACE);
    }

    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    pub fn clear(&self) {
        self.in_flight.lock().unwrap().clear();
        self.recent_upgrades.lock().unwrap().clear();
        self.cleaned.lock().unwrap().clear();
    }

    /// # Panics
    ///
    /// * If the tracker `Mutex` is poisoned
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn peer() -> SocketAddr {
        "1.2.3.4:5678".parse().unwrap()
    }

    #[test]
    fn in_flight_set_rejects_second_mark() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.mark_in_flight(peer()));
        assert!(!tracker.mark_in_flight(peer()));
        assert!(tracker.is_in_flight(peer()));

        tracker.unmark_in_flight(peer());
        assert!(!tracker.is_in_flight(peer()));
        assert!(tracker.mark_in_flight(peer()));
    }

    #[test]
    fn rapid_duplicate_detected_within_window() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();

        assert!(!tracker.is_rapid_duplicate_at("/api/chat", "1.2.3.4", now));
        assert!(tracker.is_rapid_duplicate_at(
            "/api/chat",
            "1.2.3.4",
            now + Duration::from_millis(500)
        ));
        assert!(!tracker.is_rapid_duplicate_at(
            "/api/chat",
            "1.2.3.4",
            now + Duration::from_millis(1600)
        ));
    }

    #[test]
    fn duplicate_keys_are_per_url_and_identity() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();

        assert!(!tracker.is_rapid_duplicate_at("/api/chat", "1.2.3.4", now));
        assert!(!tracker.is_rapid_duplicate_at("/api/echo", "1.2.3.4", now));
        assert!(!tracker.is_rapid_duplicate_at("/api/chat", "5.6.7.8", now));
    }

    #[test]
    fn cleanup_runs_once_per_id() {
        let tracker = ConnectionTracker::new();
        let id = Uuid::new_v4();
        let now = Instant::now();

        assert!(tracker.mark_cleaned_at(id, now));
        assert!(!tracker.mark_cleaned_at(id, now + Duration::from_secs(1)));
    }

    #[test]
    fn sweep_expires_cleanup_entries_after_grace() {
        let tracker = ConnectionTracker::new();
        let id = Uuid::new_v4();
        let now = Instant::now();

        tracker.mark_cleaned_at(id, now);
        tracker.sweep_at(now + Duration::from_secs(31));

        // Entry expired; a late duplicate event would be tolerated again.
        assert!(tracker.mark_cleaned_at(id, now + Duration::from_secs(32)));
    }

    #[test]
    fn sweep_prunes_stale_duplicate_entries() {
        let tracker = ConnectionTracker::new();
        let now = Instant::now();

        tracker.is_rapid_duplicate_at("/api/chat", "1.2.3.4", now);
        tracker.sweep_at(now + Duration::from_secs(11));
        assert_eq!(tracker.recent_upgrades.lock().unwrap().len(), 0);
    }
}
