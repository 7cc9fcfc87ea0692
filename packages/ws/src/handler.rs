//! Per-connection lifecycle.
//!
//! Each admitted connection runs one [`run_connection`] task: a select loop
//! over the inbound frame stream, the heartbeat interval, and the runtime's
//! cancellation token. Inbound activity updates pool metadata and health
//! counters and is forwarded to the user handler through its [`WsClient`].
//! Loop exit runs the close path exactly once, guarded by the tracker's
//! cleanup-once set.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::CLOSE_INTERNAL,
    graceful::run_cleanup_safely,
    health::HealthMonitor,
    pool::{ConnectionId, ConnectionPool, ConnectionSink, SinkError},
    router::{BoxError, Cleanup},
    tracker::ConnectionTracker,
};

/// Application-level ping cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A frame delivered by the transport, already decoded by the framing
/// library.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong,
    Close(Option<(u16, String)>),
}

/// A message forwarded to the user handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Text(String),
    Binary(Bytes),
}

/// The user handler's view of one client connection.
pub struct WsClient {
    id: ConnectionId,
    sink: Arc<dyn ConnectionSink>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientMessage>>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthMonitor>,
}

impl WsClient {
    /// Builds the client and the sender half the connection loop feeds.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        sink: Arc<dyn ConnectionSink>,
        pool: Arc<ConnectionPool>,
        health: Arc<HealthMonitor>,
    ) -> (Arc<Self>, mpsc::UnboundedSender<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id,
                sink,
                inbound: tokio::sync::Mutex::new(rx),
                pool,
                health,
            }),
            tx,
        )
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Receives the next inbound message, or `None` once the connection
    /// has closed.
    pub async fn recv(&self) -> Option<ClientMessage> {
        self.inbound.lock().await.recv().await
    }

    /// # Errors
    ///
    /// * If the connection is closed
    pub async fn send(&self, data: &str) -> Result<(), SinkError> {
        self.sink.send_text(data).await?;
        self.pool.record_outbound(self.id, data.len() as u64);
        self.health.on_message_out();
        Ok(())
    }

    /// # Errors
    ///
    /// * If the connection is closed
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), SinkError> {
        self.sink.send_binary(data).await?;
        self.pool.record_outbound(self.id, data.len() as u64);
        self.health.on_message_out();
        Ok(())
    }

    /// # Errors
    ///
    /// * If the connection is closed
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError> {
        self.sink.close(code, reason).await
    }
}

/// Singletons the connection loop reports into.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub pool: Arc<ConnectionPool>,
    pub tracker: Arc<ConnectionTracker>,
    pub health: Arc<HealthMonitor>,
}

pub struct ConnectionParams {
    pub id: ConnectionId,
    pub path: String,
    pub peer: Option<SocketAddr>,
    pub max_payload_size: usize,
    pub heartbeat_interval: Duration,
}

/// Drives one connection until close, error, heartbeat death, or runtime
/// shutdown, then runs the close path exactly once.
pub async fn run_connection<S>(
    deps: ConnectionDeps,
    params: ConnectionParams,
    sink: Arc<dyn ConnectionSink>,
    mut frames: S,
    forward: mpsc::UnboundedSender<ClientMessage>,
    cleanup: Option<Cleanup>,
    token: CancellationToken,
) where
    // No `Send` bound: the actix transport's frame stream is not `Send`
    // and runs on a local task.
    S: Stream<Item = Result<InboundFrame, BoxError>> + Unpin,
{
    let started = std::time::Instant::now();
    let mut heartbeat = tokio::time::interval(params.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; consume it so pings start one
    // interval in.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => {
                log::debug!("connection {}: runtime shutdown", params.id);
                break;
            }

            frame = frames.next() => match frame {
                Some(Ok(InboundFrame::Text(text))) => {
                    if text.len() > params.max_payload_size {
                        log::warn!(
                            "connection {}: payload of {} bytes exceeds limit {}",
                            params.id,
                            text.len(),
                            params.max_payload_size
                        );
                        deps.health.on_error();
                        let _ = sink.close(CLOSE_INTERNAL, "Payload too large").await;
                        break;
                    }
                    deps.pool.record_inbound(params.id, text.len() as u64);
                    deps.health.on_message_in();
                    if forward.send(ClientMessage::Text(text)).is_err() {
                        log::trace!("connection {}: handler receiver dropped", params.id);
                    }
                }

                Some(Ok(InboundFrame::Binary(data))) => {
                    if data.len() > params.max_payload_size {
                        log::warn!(
                            "connection {}: payload of {} bytes exceeds limit {}",
                            params.id,
                            data.len(),
                            params.max_payload_size
                        );
                        deps.health.on_error();
                        let _ = sink.close(CLOSE_INTERNAL, "Payload too large").await;
                        break;
                    }
                    deps.pool.record_inbound(params.id, data.len() as u64);
                    deps.health.on_message_in();
                    if forward.send(ClientMessage::Binary(data)).is_err() {
                        log::trace!("connection {}: handler receiver dropped", params.id);
                    }
                }

                Some(Ok(InboundFrame::Ping(payload))) => {
                    deps.pool.record_inbound(params.id, 0);
                    if sink.pong(&payload).await.is_err() {
                        break;
                    }
                }

                Some(Ok(InboundFrame::Pong)) => {
                    deps.pool.record_inbound(params.id, 0);
                }

                Some(Ok(InboundFrame::Close(reason))) => {
                    log::debug!("connection {}: client close {reason:?}", params.id);
                    break;
                }

                Some(Err(err)) => {
                    log::error!("connection {}: stream error: {err}", params.id);
                    deps.health.on_error();
                    break;
                }

                None => {
                    log::debug!("connection {}: stream ended", params.id);
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if sink.ping().await.is_err() {
                    log::debug!("connection {}: heartbeat ping failed", params.id);
                    break;
                }
            }
        }
    }

    finish_connection(&deps, &params, started, cleanup);
}

/// The close path. Guarded by the cleanup-once set so overlapping close
/// and error events collapse to a single execution.
fn finish_connection(
    deps: &ConnectionDeps,
    params: &ConnectionParams,
    started: std::time::Instant,
    cleanup: Option<Cleanup>,
) {
    if deps.tracker.mark_cleaned(params.id) {
        if let Some(cleanup) = cleanup {
            run_cleanup_safely(cleanup);
        }
        deps.pool.remove(params.id);
        deps.health.on_close(started.elapsed());
    } else {
        log::trace!("connection {}: duplicate close event absorbed", params.id);
    }

    if let Some(peer) = params.peer {
        deps.tracker.unmark_in_flight(peer);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pool::test_support::{RecordingSink, SinkEvent};

    fn deps() -> ConnectionDeps {
        ConnectionDeps {
            pool: Arc::new(ConnectionPool::new(10, Duration::from_secs(300))),
            tracker: Arc::new(ConnectionTracker::new()),
            health: Arc::new(HealthMonitor::new()),
        }
    }

    fn params(id: ConnectionId) -> ConnectionParams {
        ConnectionParams {
            id,
            path: "/api/echo".to_string(),
            peer: Some("1.2.3.4:5678".parse().unwrap()),
            max_payload_size: 1024,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    fn frames(
        items: Vec<Result<InboundFrame, BoxError>>,
    ) -> impl Stream<Item = Result<InboundFrame, BoxError>> + Unpin + Send {
        futures_util::stream::iter(items)
    }

    #[tokio::test]
    async fn inbound_text_updates_metrics_and_forwards() {
        let deps = deps();
        let id = uuid::Uuid::new_v4();
        let sink = Arc::new(RecordingSink::new());
        deps.pool.add(id, sink.clone(), "/api/echo").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        run_connection(
            deps.clone(),
            params(id),
            sink,
            frames(vec![Ok(InboundFrame::Text("hi".to_string()))]),
            tx,
            None,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(rx.recv().await, Some(ClientMessage::Text("hi".to_string())));
        assert_eq!(deps.health.counters().messages_in, 1);
        // Stream end closed the connection and removed it from the pool.
        assert_eq!(deps.pool.size(), 0);
        assert_eq!(deps.health.counters().connections_closed, 1);
    }

    #[tokio::test]
    async fn cleanup_runs_exactly_once() {
        let deps = deps();
        let id = uuid::Uuid::new_v4();
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::new());
        deps.pool.add(id, sink.clone(), "/api/echo").unwrap();

        let cleanups = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&cleanups);
        let cleanup: Cleanup = Box::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        run_connection(
            deps.clone(),
            params(id),
            sink,
            frames(vec![Ok(InboundFrame::Close(None))]),
            tx,
            Some(cleanup),
            CancellationToken::new(),
        )
        .await;

        // A late duplicate close event must be absorbed.
        assert!(!deps.tracker.mark_cleaned(id));
        assert_eq!(cleanups.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_payload_closes_with_internal_error() {
        let deps = deps();
        let id = uuid::Uuid::new_v4();
        let sink = Arc::new(RecordingSink::new());
        deps.pool.add(id, sink.clone(), "/api/echo").unwrap();

        let big = "x".repeat(2048);
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_connection(
            deps.clone(),
            params(id),
            sink.clone(),
            frames(vec![Ok(InboundFrame::Text(big))]),
            tx,
            None,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            sink.recorded(),
            vec![SinkEvent::Close(CLOSE_INTERNAL, "Payload too large".to_string())]
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(deps.health.counters().errors, 1);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let deps = deps();
        let id = uuid::Uuid::new_v4();
        let sink = Arc::new(RecordingSink::new());
        deps.pool.add(id, sink.clone(), "/api/echo").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        run_connection(
            deps.clone(),
            params(id),
            sink.clone(),
            frames(vec![Ok(InboundFrame::Ping(Bytes::from_static(b"hb")))]),
            tx,
            None,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(sink.recorded()[0], SinkEvent::Pong(b"hb".to_vec()));
    }

    #[tokio::test]
    async fn shutdown_token_ends_the_loop() {
        let deps = deps();
        let id = uuid::Uuid::new_v4();
        let sink = Arc::new(RecordingSink::new());
        deps.pool.add(id, sink.clone(), "/api/echo").unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let (tx, _rx) = mpsc::unbounded_channel();
        run_connection(
            deps.clone(),
            params(id),
            sink,
            frames(vec![]).chain(futures_util::stream::pending()),
            tx,
            None,
            token,
        )
        .await;

        assert_eq!(deps.pool.size(), 0);
    }

    #[tokio::test]
    async fn heartbeat_pings_while_open() {
        tokio::time::pause();

        let deps = deps();
        let id = uuid::Uuid::new_v4();
        let sink = Arc::new(RecordingSink::new());
        deps.pool.add(id, sink.clone(), "/api/echo").unwrap();

        let mut p = params(id);
        p.heartbeat_interval = Duration::from_millis(100);

        let (tx, _rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let stop = token.clone();
        let task = tokio::spawn(run_connection(
            deps.clone(),
            p,
            sink.clone(),
            frames(vec![]).chain(futures_util::stream::pending()),
            tx,
            None,
            token,
        ));

        tokio::time::advance(Duration::from_millis(350)).await;
        tokio::task::yield_now().await;
        stop.cancel();
        task.await.unwrap();

        let pings = sink
            .recorded()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Ping))
            .count();
        assert!(pings >= 2, "expected at least 2 pings, saw {pings}");
    }
}
