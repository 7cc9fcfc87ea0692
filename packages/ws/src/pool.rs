//! Registry of live connections.
//!
//! The pool owns the authoritative reference to each connection's sink and
//! its metadata. Admission is bounded by `max_connections`. Sending
//! operations (broadcast, idle close, destroy) snapshot the matching sinks
//! under the read lock and perform the sends outside it, so concurrent
//! add/remove never blocks behind slow peers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{WebsocketError, CLOSE_NORMAL};

/// Process-unique connection identifier.
pub type ConnectionId = Uuid;

/// Inactivity horizon used by `stats()` to classify a connection as idle.
const STATS_IDLE_AFTER: Duration = Duration::from_secs(60);
/// Rough per-connection memory footprint used for the pool's memory
/// estimate (buffers, session state, metadata).
pub const ESTIMATED_CONNECTION_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Connection closed")]
    Closed,
}

/// Outbound side of a connection, implemented over the actual session type
/// by the HTTP layer and by channel-backed fakes in tests.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send_text(&self, data: &str) -> Result<(), SinkError>;
    async fn send_binary(&self, data: &[u8]) -> Result<(), SinkError>;
    async fn ping(&self) -> Result<(), SinkError>;
    async fn pong(&self, payload: &[u8]) -> Result<(), SinkError>;
    async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub path: String,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct PooledConnection {
    meta: ConnectionMetadata,
    sink: Arc<dyn ConnectionSink>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub peak: usize,
    pub total_opened: u64,
    pub estimated_memory_bytes: u64,
}

/// Bounded registry of live connections.
pub struct ConnectionPool {
    connections: RwLock<HashMap<ConnectionId, PooledConnection>>,
    max_connections: usize,
    idle_timeout: Duration,
    peak: AtomicUsize,
    total_opened: AtomicU64,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            idle_timeout,
            peak: AtomicUsize::new(0),
            total_opened: AtomicU64::new(0),
        }
    }

    /// Registers a connection. Refuses when the pool is at capacity.
    ///
    /// # Errors
    ///
    /// * [`WebsocketError::ConnectionLimit`] if the pool is full
    ///
    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    pub fn add(
        &self,
        id: ConnectionId,
        sink: Arc<dyn ConnectionSink>,
        path: &str,
    ) -> Result<(), WebsocketError> {
        let mut connections = self.connections.write().unwrap();
        if connections.len() >= self.max_connections {
            return Err(WebsocketError::ConnectionLimit(connections.len()));
        }

        let now = Instant::now();
        connections.insert(
            id,
            PooledConnection {
                meta: ConnectionMetadata {
                    path: path.to_string(),
                    connected_at: now,
                    last_activity: now,
                    message_count: 0,
                    bytes_in: 0,
                    bytes_out: 0,
                },
                sink,
            },
        );

        let size = connections.len();
        self.peak.fetch_max(size, Ordering::Relaxed);
        self.total_opened.fetch_add(1, Ordering::Relaxed);
        log::debug!("pool: added connection {id} for {path} (size={size})");
        Ok(())
    }

    /// Removes a connection, returning its final metadata. Missing ids are
    /// a no-op (the cleanup-once guard lives a layer above).
    ///
    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionMetadata> {
        let removed = self.connections.write().unwrap().remove(&id);
        if let Some(conn) = &removed {
            log::debug!("pool: removed connection {id} for {}", conn.meta.path);
        }
        removed.map(|conn| conn.meta)
    }

    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    pub fn record_inbound(&self, id: ConnectionId, bytes: u64) {
        if let Some(conn) = self.connections.write().unwrap().get_mut(&id) {
            conn.meta.last_activity = Instant::now();
            conn.meta.message_count += 1;
            conn.meta.bytes_in += bytes;
        }
    }

    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    pub fn record_outbound(&self, id: ConnectionId, bytes: u64) {
        if let Some(conn) = self.connections.write().unwrap().get_mut(&id) {
            conn.meta.bytes_out += bytes;
        }
    }

    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    #[must_use]
    pub fn size(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_connections
    }

    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats_at(Instant::now())
    }

    pub(crate) fn stats_at(&self, now: Instant) -> PoolStats {
        let connections = self.connections.read().unwrap();
        let total = connections.len();
        let idle = connections
            .values()
            .filter(|conn| now.saturating_duration_since(conn.meta.last_activity) > STATS_IDLE_AFTER)
            .count();
        PoolStats {
            total,
            active: total - idle,
            idle,
            peak: self.peak.load(Ordering::Relaxed),
            total_opened: self.total_opened.load(Ordering::Relaxed),
            estimated_memory_bytes: total as u64 * ESTIMATED_CONNECTION_BYTES,
        }
    }

    /// Metadata snapshots for connections whose path contains `fragment`.
    ///
    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    #[must_use]
    pub fn connections_by_path(&self, fragment: &str) -> Vec<(ConnectionId, ConnectionMetadata)> {
        let connections = self.connections.read().unwrap();
        connections
            .iter()
            .filter(|(_, conn)| conn.meta.path.contains(fragment))
            .map(|(id, conn)| (*id, conn.meta.clone()))
            .collect()
    }

    /// Sends `payload` to every open connection whose path contains
    /// `fragment`. Per-send errors are swallowed; returns the success
    /// count.
    ///
    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    pub async fn broadcast(&self, fragment: &str, payload: &str) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn ConnectionSink>)> = {
            let connections = self.connections.read().unwrap();
            connections
                .iter()
                .filter(|(_, conn)| conn.meta.path.contains(fragment))
                .map(|(id, conn)| (*id, Arc::clone(&conn.sink)))
                .collect()
        };

        let mut sent = 0;
        for (id, sink) in targets {
            match sink.send_text(payload).await {
                Ok(()) => {
                    self.record_outbound(id, payload.len() as u64);
                    sent += 1;
                }
                Err(err) => {
                    log::trace!("broadcast: skipping {id}: {err:?}");
                }
            }
        }
        sent
    }

    /// Sends an orderly close to every connection idle past the pool's
    /// idle timeout. Returns the number of closes issued; removal happens
    /// when each connection's close event lands.
    pub async fn cleanup_idle_connections(&self) -> usize {
        self.cleanup_idle_connections_at(Instant::now()).await
    }

    pub(crate) async fn cleanup_idle_connections_at(&self, now: Instant) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn ConnectionSink>)> = {
            let connections = self.connections.read().unwrap();
            connections
                .iter()
                .filter(|(_, conn)| {
                    now.saturating_duration_since(conn.meta.last_activity) > self.idle_timeout
                })
                .map(|(id, conn)| (*id, Arc::clone(&conn.sink)))
                .collect()
        };

        let mut closed = 0;
        for (id, sink) in targets {
            log::debug!("closing idle connection {id}");
            if sink.close(CLOSE_NORMAL, "Idle timeout").await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    /// Resets the pool-level counters (peak, total opened).
    pub fn reset_metrics(&self) {
        self.peak.store(self.size(), Ordering::Relaxed);
        self.total_opened.store(0, Ordering::Relaxed);
    }

    /// Closes every connection with 1000/"Server shutdown" and clears the
    /// registry.
    ///
    /// # Panics
    ///
    /// * If the pool `RwLock` is poisoned
    pub async fn destroy(&self) {
        let targets: Vec<(ConnectionId, Arc<dyn ConnectionSink>)> = {
            let mut connections = self.connections.write().unwrap();
            connections
                .drain()
                .map(|(id, conn)| (id, conn.sink))
                .collect()
        };

        for (id, sink) in targets {
            if let Err(err) = sink.close(CLOSE_NORMAL, "Server shutdown").await {
                log::trace!("destroy: close failed for {id}: {err:?}");
            }
        }
    }
}

/// Shared handle passed to each route's connection factory.
///
/// Exposes the operations a route module may need against the running
/// server: broadcast to connections and pool statistics.
#[derive(Clone)]
pub struct ServerHandle {
    pool: Arc<ConnectionPool>,
}

impl ServerHandle {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn broadcast(&self, path_fragment: &str, payload: &str) -> usize {
        self.pool.broadcast(path_fragment, payload).await
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[must_use]
    pub fn connections_by_path(&self, fragment: &str) -> Vec<(ConnectionId, ConnectionMetadata)> {
        self.pool.connections_by_path(fragment)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::{async_trait, ConnectionSink, SinkError};

    /// What a fake sink observed, for assertions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SinkEvent {
        Text(String),
        Binary(Vec<u8>),
        Ping,
        Pong(Vec<u8>),
        Close(u16, String),
    }

    pub struct RecordingSink {
        pub events: Mutex<Vec<SinkEvent>>,
        pub fail_sends: bool,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                fail_sends: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                fail_sends: true,
            }
        }

        pub fn recorded(&self) -> Vec<SinkEvent> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: SinkEvent) -> Result<(), SinkError> {
            if self.fail_sends {
                return Err(SinkError::Closed);
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionSink for RecordingSink {
        async fn send_text(&self, data: &str) -> Result<(), SinkError> {
            self.record(SinkEvent::Text(data.to_string()))
        }

        async fn send_binary(&self, data: &[u8]) -> Result<(), SinkError> {
            self.record(SinkEvent::Binary(data.to_vec()))
        }

        async fn ping(&self) -> Result<(), SinkError> {
            self.record(SinkEvent::Ping)
        }

        async fn pong(&self, payload: &[u8]) -> Result<(), SinkError> {
            self.record(SinkEvent::Pong(payload.to_vec()))
        }

        async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError> {
            self.record(SinkEvent::Close(code, reason.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{test_support::*, *};

    fn pool() -> ConnectionPool {
        ConnectionPool::new(2, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn add_refuses_at_capacity() {
        let pool = pool();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        pool.add(a, Arc::new(RecordingSink::new()), "/api/chat").unwrap();
        pool.add(b, Arc::new(RecordingSink::new()), "/api/chat").unwrap();

        let err = pool.add(c, Arc::new(RecordingSink::new()), "/api/chat");
        assert!(matches!(err, Err(WebsocketError::ConnectionLimit(2))));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn remove_is_noop_for_missing_id() {
        let pool = pool();
        assert!(pool.remove(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn stats_classify_idle_connections() {
        let pool = pool();
        let id = Uuid::new_v4();
        pool.add(id, Arc::new(RecordingSink::new()), "/api/chat").unwrap();

        let now = Instant::now();
        let stats = pool.stats_at(now);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);

        let stats = pool.stats_at(now + Duration::from_secs(120));
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.peak, 1);
    }

    #[tokio::test]
    async fn broadcast_matches_path_and_counts_successes() {
        let pool = ConnectionPool::new(10, Duration::from_secs(300));
        let chat = Arc::new(RecordingSink::new());
        let echo = Arc::new(RecordingSink::new());
        let broken = Arc::new(RecordingSink::failing());

        pool.add(Uuid::new_v4(), chat.clone(), "/api/chat").unwrap();
        pool.add(Uuid::new_v4(), echo.clone(), "/api/echo").unwrap();
        pool.add(Uuid::new_v4(), broken, "/api/chat/town").unwrap();

        let sent = pool.broadcast("/api/chat", "hello").await;

        assert_eq!(sent, 1);
        assert_eq!(chat.recorded(), vec![SinkEvent::Text("hello".to_string())]);
        assert_eq!(echo.recorded(), vec![]);
    }

    #[tokio::test]
    async fn idle_cleanup_sends_normal_close() {
        let pool = ConnectionPool::new(10, Duration::from_secs(300));
        let sink = Arc::new(RecordingSink::new());
        pool.add(Uuid::new_v4(), sink.clone(), "/api/chat").unwrap();

        let closed = pool
            .cleanup_idle_connections_at(Instant::now() + Duration::from_secs(301))
            .await;

        assert_eq!(closed, 1);
        assert_eq!(
            sink.recorded(),
            vec![SinkEvent::Close(CLOSE_NORMAL, "Idle timeout".to_string())]
        );
        // Still registered; removal happens via the close event.
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn destroy_closes_all_and_clears() {
        let pool = ConnectionPool::new(10, Duration::from_secs(300));
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        pool.add(Uuid::new_v4(), a.clone(), "/api/chat").unwrap();
        pool.add(Uuid::new_v4(), b.clone(), "/api/echo").unwrap();

        pool.destroy().await;

        assert_eq!(pool.size(), 0);
        assert_eq!(
            a.recorded(),
            vec![SinkEvent::Close(CLOSE_NORMAL, "Server shutdown".to_string())]
        );
        assert_eq!(
            b.recorded(),
            vec![SinkEvent::Close(CLOSE_NORMAL, "Server shutdown".to_string())]
        );
    }

    #[tokio::test]
    async fn inbound_activity_updates_metadata() {
        let pool = pool();
        let id = Uuid::new_v4();
        pool.add(id, Arc::new(RecordingSink::new()), "/api/chat").unwrap();

        pool.record_inbound(id, 5);
        pool.record_inbound(id, 7);
        pool.record_outbound(id, 3);

        let (_, meta) = pool.connections_by_path("/api/chat").pop().unwrap();
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.bytes_in, 12);
        assert_eq!(meta.bytes_out, 3);
    }

    #[tokio::test]
    async fn reset_metrics_clears_counters() {
        let pool = pool();
        pool.add(Uuid::new_v4(), Arc::new(RecordingSink::new()), "/x").unwrap();
        pool.reset_metrics();

        let stats = pool.stats();
        assert_eq!(stats.total_opened, 0);
        assert_eq!(stats.peak, 1);
    }
}
