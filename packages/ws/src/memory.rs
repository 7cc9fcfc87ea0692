//! Process-memory monitoring and prioritised cleanup.
//!
//! The manager samples process memory through a [`MemorySource`] capability
//! (production uses `sysinfo`; tests inject fixed samples), classifies the
//! utilisation against warning/critical/maximum thresholds, and runs
//! registered cleanup strategies in descending priority until pressure
//! drops below the warning level. A host-level GC hook is an optional
//! capability: when absent, the top-priority strategy reports zero bytes
//! freed.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Minimum delay between unforced cleanup runs.
const CLEANUP_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryThresholds {
    pub warning: f64,
    pub critical: f64,
    pub maximum: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning: 90.0,
            critical: 95.0,
            maximum: 98.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub heap_used: u64,
    pub heap_total: u64,
    pub rss: u64,
}

/// Capability for reading process memory.
pub trait MemorySource: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Production source backed by `sysinfo`.
pub struct SysinfoSource {
    system: Mutex<sysinfo::System>,
}

impl SysinfoSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SysinfoSource {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();

        let rss = sysinfo::get_current_pid().ok().and_then(|pid| {
            let _ = system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            system.process(pid).map(|process| process.memory())
        });

        let rss = rss.unwrap_or(0);
        MemorySample {
            heap_used: rss,
            heap_total: system.total_memory(),
            rss,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub heap_used: u64,
    pub heap_total: u64,
    pub rss: u64,
    pub percentage: f64,
    pub connection_count: usize,
    pub estimated_per_connection_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySummary {
    pub name: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub stats: MemoryStats,
    pub thresholds: MemoryThresholds,
    pub strategies: Vec<StrategySummary>,
    pub cooldown_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub strategies_run: Vec<String>,
    pub freed_bytes: u64,
}

type StrategyFn = Box<dyn Fn() -> BoxFuture<'static, u64> + Send + Sync>;

struct CleanupStrategy {
    name: String,
    priority: u8,
    run: StrategyFn,
}

type ConnectionCounter = Box<dyn Fn() -> usize + Send + Sync>;

pub struct MemoryManager {
    thresholds: MemoryThresholds,
    source: Box<dyn MemorySource>,
    connections: ConnectionCounter,
    strategies: Mutex<Vec<CleanupStrategy>>,
    last_cleanup: Mutex<Option<Instant>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

impl MemoryManager {
    #[must_use]
    pub fn new(
        thresholds: MemoryThresholds,
        source: Box<dyn MemorySource>,
        connections: ConnectionCounter,
    ) -> Self {
        Self {
            thresholds,
            source,
            connections,
            strategies: Mutex::new(Vec::new()),
            last_cleanup: Mutex::new(None),
            monitor: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// # Panics
    ///
    /// * If an internal `Mutex` is poisoned
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let sample = self.source.sample();
        let connection_count = (self.connections)();
        let percentage = if sample.heap_total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let pct = sample.heap_used as f64 / sample.heap_total as f64 * 100.0;
            pct
        };
        let estimated_per_connection_bytes = if connection_count == 0 {
            0
        } else {
            sample.rss / connection_count as u64
        };
        MemoryStats {
            heap_used: sample.heap_used,
            heap_total: sample.heap_total,
            rss: sample.rss,
            percentage,
            connection_count,
            estimated_per_connection_bytes,
        }
    }

    /// Whether the process is below the maximum threshold and may accept
    /// new connections.
    #[must_use]
    pub fn acceptable(&self) -> bool {
        self.stats().percentage < self.thresholds.maximum
    }

    /// Registers a cleanup strategy. The work must happen inside the
    /// returned future: futures for a cleanup run are built up front and a
    /// run may stop before awaiting them all.
    ///
    /// # Panics
    ///
    /// * If the strategy `Mutex` is poisoned
    pub fn register_cleanup_strategy<F>(&self, name: &str, priority: u8, run: F)
    where
        F: Fn() -> BoxFuture<'static, u64> + Send + Sync + 'static,
    {
        let mut strategies = self.strategies.lock().unwrap();
        strategies.push(CleanupStrategy {
            name: name.to_string(),
            priority,
            run: Box::new(run),
        });
        strategies.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Runs cleanup strategies against the current pressure level.
    ///
    /// At critical every strategy runs, at warning only those with
    /// priority ≥ 5, and a forced run admits priority ≥ 3 regardless of
    /// level. Strategies run in descending priority; after each, pressure
    /// is re-sampled and the run stops as soon as it falls below warning.
    /// Unforced runs are subject to a 30 s cooldown.
    pub async fn execute_cleanup(&self, force: bool) -> CleanupOutcome {
        self.execute_cleanup_at(force, Instant::now()).await
    }

    pub(crate) async fn execute_cleanup_at(&self, force: bool, now: Instant) -> CleanupOutcome {
        if !force && self.cooldown_active_at(now) {
            log::debug!("memory cleanup skipped: cooldown active");
            return CleanupOutcome::default();
        }

        let stats = self.stats();
        let min_priority = if stats.percentage >= self.thresholds.critical {
            0
        } else if stats.percentage >= self.thresholds.warning {
            5
        } else if force {
            3
        } else {
            return CleanupOutcome::default();
        };

        *self.last_cleanup.lock().unwrap() = Some(now);

        // Snapshot (name, future) pairs so strategy closures run without
        // the lock held.
        let runnable: Vec<(String, BoxFuture<'static, u64>)> = {
            let strategies = self.strategies.lock().unwrap();
            strategies
                .iter()
                .filter(|s| s.priority >= min_priority)
                .map(|s| (s.name.clone(), (s.run)()))
                .collect()
        };

        let mut outcome = CleanupOutcome::default();
        for (name, future) in runnable {
            let freed = future.await;
            log::debug!("memory cleanup strategy {name} freed {freed} bytes");
            outcome.freed_bytes += freed;
            outcome.strategies_run.push(name);

            if self.stats().percentage < self.thresholds.warning {
                break;
            }
        }
        outcome
    }

    /// Runs cleanup if utilisation has reached the warning level.
    pub async fn check_and_cleanup(&self) -> CleanupOutcome {
        if self.stats().percentage >= self.thresholds.warning {
            self.execute_cleanup(false).await
        } else {
            CleanupOutcome::default()
        }
    }

    fn cooldown_active_at(&self, now: Instant) -> bool {
        self.last_cleanup
            .lock()
            .unwrap()
            .is_some_and(|last| now.saturating_duration_since(last) < CLEANUP_COOLDOWN)
    }

    /// Starts the periodic monitor calling [`Self::check_and_cleanup`].
    /// Restarting replaces the previous task.
    ///
    /// # Panics
    ///
    /// * If the monitor `Mutex` is poisoned
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.check_and_cleanup().await;
                    }
                }
            }
        });

        if let Some(previous) = self.monitor.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// # Panics
    ///
    /// * If the monitor `Mutex` is poisoned
    pub fn stop_monitoring(&self) {
        self.token.cancel();
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// # Panics
    ///
    /// * If an internal `Mutex` is poisoned
    #[must_use]
    pub fn generate_report(&self) -> MemoryReport {
        let strategies = self
            .strategies
            .lock()
            .unwrap()
            .iter()
            .map(|s| StrategySummary {
                name: s.name.clone(),
                priority: s.priority,
            })
            .collect();
        MemoryReport {
            stats: self.stats(),
            thresholds: self.thresholds,
            strategies,
            cooldown_active: self.cooldown_active_at(Instant::now()),
        }
    }
}
