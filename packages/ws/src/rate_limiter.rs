//! Sliding-window upgrade rate limiting.
//!
//! Limiters are keyed by (route pattern, client identity) and created
//! lazily for routes that carry a rate-limit rule; routes without a rule
//! bypass this module entirely. Each check prunes the bucket to the active
//! window before deciding, and a periodic sweep deletes empty buckets.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub window: Duration,
    pub max_requests: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: usize,
    pub current: usize,
    pub remaining: usize,
    /// Milliseconds until the oldest recorded request leaves the window.
    pub reset_in_ms: u64,
}

/// Derives the client identity used for rate-limit bucketing.
///
/// First non-empty of: leftmost `X-Forwarded-For` token, `X-Real-IP`, the
/// peer IP address, the literal `unknown`.
#[must_use]
pub fn client_identity(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<SocketAddr>,
) -> String {
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = real_ip {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

#[derive(Debug, Default)]
struct RouteLimiter {
    buckets: HashMap<String, VecDeque<Instant>>,
}

impl RouteLimiter {
    fn check(&mut self, identity: &str, rule: RateLimitRule, now: Instant) -> (bool, RateLimitInfo) {
        let bucket = self.buckets.entry(identity.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.saturating_duration_since(*front) >= rule.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        let admitted = bucket.len() < rule.max_requests;
        if admitted {
            bucket.push_back(now);
        }

        let current = bucket.len();
        let reset_in = bucket.front().map_or(rule.window, |oldest| {
            rule.window
                .saturating_sub(now.saturating_duration_since(*oldest))
        });
        let info = RateLimitInfo {
            limit: rule.max_requests,
            current,
            remaining: rule.max_requests.saturating_sub(current),
            reset_in_ms: u64::try_from(reset_in.as_millis()).unwrap_or(u64::MAX),
        };
        (admitted, info)
    }

    fn sweep(&mut self, now: Instant, window: Duration) {
        self.buckets.retain(|_, bucket| {
            while let Some(front) = bucket.front() {
                if now.saturating_duration_since(*front) >= window {
                    bucket.pop_front();
                } else {
                    break;
                }
            }
            !bucket.is_empty()
        });
    }
}

/// Per-route limiter map, keyed by route pattern.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, RouteLimiter>>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether `identity` may upgrade on `route` under `rule`,
    /// recording the request on admission.
    ///
    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn check(&self, route: &str, identity: &str, rule: RateLimitRule) -> (bool, RateLimitInfo) {
        self.check_at(route, identity, rule, Instant::now())
    }

    pub(crate) fn check_at(
        &self,
        route: &str,
        identity: &str,
        rule: RateLimitRule,
        now: Instant,
    ) -> (bool, RateLimitInfo) {
        let mut limiters = self.limiters.lock().unwrap();
        let limiter = limiters.entry(route.to_string()).or_default();
        let (admitted, info) = limiter.check(identity, rule, now);
        if !admitted {
            log::debug!(
                "rate limit hit for {identity} on {route}: {}/{} in window",
                info.current,
                info.limit
            );
        }
        (admitted, info)
    }

    /// Prunes expired timestamps and deletes empty buckets.
    ///
    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn sweep(&self, window: Duration) {
        self.sweep_at(Instant::now(), window);
    }

    pub(crate) fn sweep_at(&self, now: Instant, window: Duration) {
        let mut limiters = self.limiters.lock().unwrap();
        for limiter in limiters.values_mut() {
            limiter.sweep(now, window);
        }
        limiters.retain(|_, limiter| !limiter.buckets.is_empty());
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        let limiters = self.limiters.lock().unwrap();
        limiters.values().map(|l| l.buckets.len()).sum()
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn clear(&self) {
        self.limiters.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const RULE: RateLimitRule = RateLimitRule {
        window: Duration::from_millis(1000),
        max_requests: 2,
    };

    #[test]
    fn identity_prefers_forwarded_for_leftmost_token() {
        let peer = "10.0.0.1:9000".parse().ok();
        assert_eq!(
            client_identity(Some("1.2.3.4, 5.6.7.8"), Some("9.9.9.9"), peer),
            "1.2.3.4"
        );
        assert_eq!(client_identity(Some("  "), Some("9.9.9.9"), peer), "9.9.9.9");
        assert_eq!(client_identity(None, None, peer), "10.0.0.1");
        assert_eq!(client_identity(None, None, None), "unknown");
    }

    #[test]
    fn admits_up_to_max_requests_within_window() {
        let registry = RateLimiterRegistry::new();
        let now = Instant::now();

        let (first, _) = registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        let (second, _) = registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        let (third, info) =
            registry.check_at("/api/chat", "1.2.3.4", RULE, now + Duration::from_millis(500));

        assert!(first);
        assert!(second);
        assert!(!third);
        assert_eq!(info.current, 2);
        assert_eq!(info.remaining, 0);
    }

    #[test]
    fn window_expiry_readmits() {
        let registry = RateLimiterRegistry::new();
        let now = Instant::now();

        registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        registry.check_at("/api/chat", "1.2.3.4", RULE, now);

        let (admitted, info) =
            registry.check_at("/api/chat", "1.2.3.4", RULE, now + Duration::from_millis(1001));
        assert!(admitted);
        assert_eq!(info.current, 1);
    }

    #[test]
    fn identities_get_independent_buckets() {
        let registry = RateLimiterRegistry::new();
        let now = Instant::now();

        registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        let (other, _) = registry.check_at("/api/chat", "5.6.7.8", RULE, now);

        assert!(other);
    }

    #[test]
    fn reset_in_tracks_oldest_timestamp() {
        let registry = RateLimiterRegistry::new();
        let now = Instant::now();

        let (_, info) = registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        assert_eq!(info.reset_in_ms, 1000);

        let (_, info) =
            registry.check_at("/api/chat", "1.2.3.4", RULE, now + Duration::from_millis(400));
        assert_eq!(info.reset_in_ms, 600);
    }

    #[test]
    fn sweep_deletes_empty_buckets() {
        let registry = RateLimiterRegistry::new();
        let now = Instant::now();

        registry.check_at("/api/chat", "1.2.3.4", RULE, now);
        assert_eq!(registry.bucket_count(), 1);

        registry.sweep_at(now + Duration::from_secs(2), RULE.window);
        assert_eq!(registry.bucket_count(), 0);
    }
}
