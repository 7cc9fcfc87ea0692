//! Per-route circuit breakers.
//!
//! Each resolved route gets a three-state breaker gating upgrade admission.
//! Failures are counted over a sliding window; once the windowed count
//! reaches the threshold the breaker opens and stays open for the reset
//! timeout, after which a single probe is allowed through in half-open
//! state. Breakers are created lazily and evicted after an hour without
//! activity.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;
use strum_macros::AsRefStr;

use crate::error::ErrorCode;

/// How long a breaker may sit untouched before the sweep evicts it.
const IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub monitoring_window: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(5 * 60),
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub windowed_failures: usize,
    pub seconds_since_last_failure: Option<u64>,
    pub seconds_since_last_success: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    last_activity: Instant,
    total_requests: u64,
    failure_window: VecDeque<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    fn new_at(config: BreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_success: None,
            last_activity: now,
            total_requests: 0,
            failure_window: VecDeque::new(),
        }
    }

    /// Whether a request may pass right now. In open state this flips the
    /// breaker to half-open once the reset timeout has elapsed since the
    /// last failure.
    pub fn can_execute(&mut self) -> bool {
        self.can_execute_at(Instant::now())
    }

    pub(crate) fn can_execute_at(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        self.total_requests += 1;
        self.prune_window(now);

        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map_or(Duration::MAX, |t| now.saturating_duration_since(t));
                if elapsed >= self.config.reset_timeout {
                    log::debug!("circuit breaker half-open after {elapsed:?}");
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Instant::now());
    }

    pub(crate) fn record_success_at(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_success = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    log::debug!(
                        "circuit breaker closed after {} consecutive successes",
                        self.consecutive_successes
                    );
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.consecutive_successes = 0;
                    self.failure_window.clear();
                }
            }
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, code: ErrorCode) {
        self.record_failure_at(code, Instant::now());
    }

    pub(crate) fn record_failure_at(&mut self, code: ErrorCode, now: Instant) {
        self.last_activity = now;
        self.last_failure = Some(now);
        self.failure_count += 1;
        self.failure_window.push_back(now);
        self.prune_window(now);

        match self.state {
            CircuitState::HalfOpen => {
                log::debug!("circuit breaker re-opened by {code:?} during probe");
                self.state = CircuitState::Open;
                self.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                if self.failure_window.len() >= self.config.failure_threshold as usize {
                    log::warn!(
                        "circuit breaker opened: {} failures in window (last: {code:?})",
                        self.failure_window.len()
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn prune_window(&mut self, now: Instant) {
        let horizon = self.config.monitoring_window;
        while let Some(front) = self.failure_window.front() {
            if now.saturating_duration_since(*front) > horizon {
                self.failure_window.pop_front();
            } else {
                break;
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        self.stats_at(Instant::now())
    }

    fn stats_at(&self, now: Instant) -> BreakerStats {
        BreakerStats {
            state: self.state,
            failure_count: self.failure_count,
            consecutive_successes: self.consecutive_successes,
            total_requests: self.total_requests,
            windowed_failures: self.failure_window.len(),
            seconds_since_last_failure: self
                .last_failure
                .map(|t| now.saturating_duration_since(t).as_secs()),
            seconds_since_last_success: self
                .last_success
                .map(|t| now.saturating_duration_since(t).as_secs()),
        }
    }

    /// Manually return the breaker to closed with all counters cleared.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.consecutive_successes = 0;
        self.failure_window.clear();
    }

    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }
}

/// Lazily-populated map of route pattern to breaker.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn can_execute(&self, route: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(route.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config))
            .can_execute()
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn record_success(&self, route: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(route.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config))
            .record_success();
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn record_failure(&self, route: &str, code: ErrorCode) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(route.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config))
            .record_failure(code);
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    #[must_use]
    pub fn any_open(&self) -> bool {
        let breakers = self.breakers.lock().unwrap();
        breakers.values().any(|b| b.state() == CircuitState::Open)
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    #[must_use]
    pub fn stats(&self) -> HashMap<String, BreakerStats> {
        let breakers = self.breakers.lock().unwrap();
        breakers
            .iter()
            .map(|(route, b)| (route.clone(), b.stats()))
            .collect()
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    #[must_use]
    pub fn breaker_count(&self) -> usize {
        self.breakers.lock().unwrap().len()
    }

    /// Evicts breakers with no activity for an hour. Returns the eviction
    /// count.
    ///
    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let mut breakers = self.breakers.lock().unwrap();
        let before = breakers.len();
        breakers.retain(|route, b| {
            let keep = now.saturating_duration_since(b.last_activity) < IDLE_EVICTION;
            if !keep {
                log::debug!("evicting idle circuit breaker for {route}");
            }
            keep
        });
        before - breakers.len()
    }

    /// # Panics
    ///
    /// * If the registry `Mutex` is poisoned
    pub fn clear(&self) {
        self.breakers.lock().unwrap().clear();
    }
}
