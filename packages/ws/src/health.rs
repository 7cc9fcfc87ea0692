//! Aggregated runtime health.
//!
//! Counters are plain atomics so overlapping upgrade and per-connection
//! callbacks can record without coordination. Recent connection durations
//! are kept in a bounded window (cap 1000, trimmed to 500 on overflow) for
//! the rolling average. The status rollup combines these counters with
//! inputs sampled from the pool, breakers and memory manager.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use strum_macros::AsRefStr;

const DURATION_WINDOW_CAP: usize = 1000;
const DURATION_WINDOW_TRIM: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Inputs sampled from the other singletons at rollup time.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub heap_percentage: f64,
    pub any_breaker_open: bool,
    pub active_connections: usize,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCounters {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub errors: u64,
    pub upgrades_attempted: u64,
    pub upgrades_failed: u64,
    pub average_connection_duration_ms: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    errors: AtomicU64,
    upgrades_attempted: AtomicU64,
    upgrades_failed: AtomicU64,
    durations: Mutex<VecDeque<Duration>>,
    started: Option<Instant>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub fn on_upgrade_attempt(&self) {
        self.upgrades_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_upgrade_failure(&self) {
        self.upgrades_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// # Panics
    ///
    /// * If the duration window `Mutex` is poisoned
    pub fn on_close(&self, duration: Duration) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);

        let mut durations = self.durations.lock().unwrap();
        durations.push_back(duration);
        if durations.len() > DURATION_WINDOW_CAP {
            while durations.len() > DURATION_WINDOW_TRIM {
                durations.pop_front();
            }
        }
    }

    pub fn on_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_message_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// # Panics
    ///
    /// * If the duration window `Mutex` is poisoned
    #[must_use]
    pub fn average_connection_duration(&self) -> Duration {
        let durations = self.durations.lock().unwrap();
        if durations.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = durations.iter().sum();
        total / u32::try_from(durations.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        let attempted = self.upgrades_attempted.load(Ordering::Relaxed);
        if attempted == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.upgrades_failed.load(Ordering::Relaxed) as f64 / attempted as f64;
        ratio
    }

    /// # Panics
    ///
    /// * If the duration window `Mutex` is poisoned
    #[must_use]
    pub fn counters(&self) -> HealthCounters {
        HealthCounters {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            upgrades_attempted: self.upgrades_attempted.load(Ordering::Relaxed),
            upgrades_failed: self.upgrades_failed.load(Ordering::Relaxed),
            average_connection_duration_ms: u64::try_from(
                self.average_connection_duration().as_millis(),
            )
            .unwrap_or(u64::MAX),
            uptime_seconds: self.started.map_or(0, |started| started.elapsed().as_secs()),
        }
    }

    /// Rolls the counters and sampled inputs up into a single status.
    #[must_use]
    pub fn status(&self, inputs: &HealthInputs) -> HealthStatus {
        let failure_ratio = self.failure_ratio();

        if failure_ratio > 0.5 || inputs.heap_percentage > 90.0 {
            return HealthStatus::Unhealthy;
        }

        #[allow(clippy::cast_precision_loss)]
        let capacity_ratio = if inputs.max_connections == 0 {
            0.0
        } else {
            inputs.active_connections as f64 / inputs.max_connections as f64
        };

        if failure_ratio > 0.2
            || inputs.heap_percentage > 80.0
            || inputs.any_breaker_open
            || capacity_ratio >= 0.9
        {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn quiet_inputs() -> HealthInputs {
        HealthInputs {
            heap_percentage: 10.0,
            any_breaker_open: false,
            active_connections: 0,
            max_connections: 1000,
        }
    }

    #[test]
    fn healthy_when_nothing_is_wrong() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.status(&quiet_inputs()), HealthStatus::Healthy);
    }

    #[test]
    fn unhealthy_on_failure_ratio_above_half() {
        let monitor = HealthMonitor::new();
        for _ in 0..10 {
            monitor.on_upgrade_attempt();
        }
        for _ in 0..6 {
            monitor.on_upgrade_failure();
        }
        assert_eq!(monitor.status(&quiet_inputs()), HealthStatus::Unhealthy);
    }

    #[test]
    fn unhealthy_on_heap_pressure() {
        let monitor = HealthMonitor::new();
        let inputs = HealthInputs {
            heap_percentage: 91.0,
            ..quiet_inputs()
        };
        assert_eq!(monitor.status(&inputs), HealthStatus::Unhealthy);
    }

    #[test]
    fn degraded_on_moderate_failure_ratio() {
        let monitor = HealthMonitor::new();
        for _ in 0..10 {
            monitor.on_upgrade_attempt();
        }
        for _ in 0..3 {
            monitor.on_upgrade_failure();
        }
        assert_eq!(monitor.status(&quiet_inputs()), HealthStatus::Degraded);
    }

    #[test]
    fn degraded_on_open_breaker_or_near_capacity() {
        let monitor = HealthMonitor::new();

        let inputs = HealthInputs {
            any_breaker_open: true,
            ..quiet_inputs()
        };
        assert_eq!(monitor.status(&inputs), HealthStatus::Degraded);

        let inputs = HealthInputs {
            active_connections: 900,
            max_connections: 1000,
            ..quiet_inputs()
        };
        assert_eq!(monitor.status(&inputs), HealthStatus::Degraded);
    }

    #[test]
    fn average_duration_over_window() {
        let monitor = HealthMonitor::new();
        monitor.on_close(Duration::from_millis(100));
        monitor.on_close(Duration::from_millis(300));
        assert_eq!(monitor.average_connection_duration(), Duration::from_millis(200));
    }

    #[test]
    fn duration_window_trims_on_overflow() {
        let monitor = HealthMonitor::new();
        for _ in 0..=DURATION_WINDOW_CAP {
            monitor.on_close(Duration::from_millis(10));
        }
        assert_eq!(monitor.durations.lock().unwrap().len(), DURATION_WINDOW_TRIM);
    }

    #[test]
    fn counters_track_messages_and_errors() {
        let monitor = HealthMonitor::new();
        monitor.on_open();
        monitor.on_message_in();
        monitor.on_message_in();
        monitor.on_message_out();
        monitor.on_error();

        let counters = monitor.counters();
        assert_eq!(counters.connections_opened, 1);
        assert_eq!(counters.messages_in, 2);
        assert_eq!(counters.messages_out, 1);
        assert_eq!(counters.errors, 1);
    }
}
