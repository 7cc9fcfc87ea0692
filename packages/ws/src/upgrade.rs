//! The upgrade orchestrator.
//!
//! [`WsRuntime`] owns the process singletons (pool, tracker, breakers,
//! limiters, memory manager, health monitor, route resolver) and runs the
//! admission pipeline for every upgrade request: reserved-prefix skip,
//! in-flight and rapid-duplicate dedupe, rate check, route resolution,
//! origin check, breaker gate, and the one-shot factory lookup. Failures
//! before the handshake refuse the socket with the error's advisory HTTP
//! status; factory failures complete the handshake and close with a
//! protocol-level frame; post-handshake resource refusals close with 1013.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{FutureExt, Stream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    breaker::BreakerRegistry,
    config::{EffectiveRouteConfig, WsConfig},
    error::{WebsocketError, CLOSE_OVERLOADED},
    graceful::{close_frame_for, close_gracefully, execute_handler_safely, CloseOptions},
    handler::{
        run_connection, ConnectionDeps, ConnectionParams, InboundFrame, WsClient,
        HEARTBEAT_INTERVAL,
    },
    health::{HealthInputs, HealthMonitor, HealthStatus},
    memory::{MemoryManager, MemorySource, MemoryThresholds, SysinfoSource},
    pool::{ConnectionPool, ConnectionSink, ServerHandle, ESTIMATED_CONNECTION_BYTES},
    rate_limiter::{client_identity, RateLimiterRegistry},
    router::{
        pattern_matches, BoxError, ConnectionHandler, ModuleLoader, ResolvedRoute, RouteResolver,
        RouteTable, UpgradeContext,
    },
    tracker::ConnectionTracker,
};

/// Framework-internal path prefix the orchestrator never handles.
pub const INTERNAL_PREFIX: &str = "/_trellis";

const TRACKER_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BREAKER_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MEMORY_MONITOR_INTERVAL: Duration = Duration::from_secs(60);
/// Heap percentage above which the pool sweep nudges the GC hook.
const GC_HINT_PERCENTAGE: f64 = 80.0;

/// Optional host-level GC capability.
pub type GcHook = Box<dyn Fn() -> u64 + Send + Sync>;

/// Transport-independent view of an upgrade request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub path: &'a str,
    pub peer: Option<SocketAddr>,
    pub forwarded_for: Option<&'a str>,
    pub real_ip: Option<&'a str>,
    pub origin: Option<&'a str>,
}

/// A request that passed admission and may be handed to the framing layer.
pub struct Admission {
    pub route: ResolvedRoute,
    pub handler: ConnectionHandler,
    pub route_config: EffectiveRouteConfig,
    pub client_identity: String,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("route", &self.route)
            .field("handler", &"<handler fn>")
            .field("route_config", &self.route_config)
            .field("client_identity", &self.client_identity)
            .finish()
    }
}

/// Why an upgrade was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    /// Path belongs to the framework's internal channels; let other
    /// services see the request.
    NotHandled,
    /// Dropped silently (duplicate socket or rapid duplicate client).
    Ignored,
    /// Refused before the handshake with an advisory HTTP status.
    Refused { status: u16, reason: String },
    /// Complete the handshake, then close with this frame.
    CloseAfterHandshake { code: u16, reason: String },
}

pub struct WsRuntime {
    config: Arc<WsConfig>,
    resolver: Arc<RouteResolver>,
    pool: Arc<ConnectionPool>,
    tracker: Arc<ConnectionTracker>,
    breakers: Arc<BreakerRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    memory: Arc<MemoryManager>,
    health: Arc<HealthMonitor>,
    gc_hook: Arc<Option<GcHook>>,
    token: CancellationToken,
    attached: AtomicBool,
}

impl WsRuntime {
    /// Builds a runtime with the production memory source and no GC hook.
    #[must_use]
    pub fn new(config: WsConfig, table: RouteTable, loader: Arc<dyn ModuleLoader>) -> Arc<Self> {
        Self::with_parts(config, table, loader, Box::new(SysinfoSource::new()), None)
    }

    /// Fully-injected constructor; tests use this to supply a
    /// deterministic memory source. No global state is touched.
    #[must_use]
    pub fn with_parts(
        config: WsConfig,
        table: RouteTable,
        loader: Arc<dyn ModuleLoader>,
        memory_source: Box<dyn MemorySource>,
        gc_hook: Option<GcHook>,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(
            config.max_connections,
            config.idle_timeout(),
        ));
        let counter_pool = Arc::clone(&pool);
        let memory = Arc::new(MemoryManager::new(
            MemoryThresholds::default(),
            memory_source,
            Box::new(move || counter_pool.size()),
        ));

        let runtime = Arc::new(Self {
            resolver: Arc::new(RouteResolver::new(table, loader)),
            breakers: Arc::new(BreakerRegistry::new(config.circuit_breaker.into())),
            limiters: Arc::new(RateLimiterRegistry::new()),
            tracker: Arc::new(ConnectionTracker::new()),
            health: Arc::new(HealthMonitor::new()),
            gc_hook: Arc::new(gc_hook),
            config: Arc::new(config),
            token: CancellationToken::new(),
            attached: AtomicBool::new(false),
            pool,
            memory,
        });
        runtime.register_default_strategies();
        runtime
    }

    /// Whether the runtime has everything it needs to serve upgrades.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.config.enabled && self.resolver.has_candidates()
    }

    #[must_use]
    pub fn server_handle(&self) -> ServerHandle {
        ServerHandle::new(Arc::clone(&self.pool))
    }

    #[must_use]
    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Starts the background sweeps. Idempotent: the second and later
    /// calls on the same runtime return `false` and have no side effects.
    pub fn setup(self: &Arc<Self>) -> bool {
        if self.attached.swap(true, Ordering::SeqCst) {
            log::debug!("websocket runtime already attached; setup is a no-op");
            return false;
        }

        self.spawn_sweep("tracker", TRACKER_SWEEP_INTERVAL, {
            let tracker = Arc::clone(&self.tracker);
            move || {
                tracker.sweep();
                async {}.boxed()
            }
        });
        self.spawn_sweep("rate-limiter", LIMITER_SWEEP_INTERVAL, {
            let limiters = Arc::clone(&self.limiters);
            let window = self.largest_rate_limit_window();
            move || {
                limiters.sweep(window);
                async {}.boxed()
            }
        });
        self.spawn_sweep("circuit-breaker", BREAKER_SWEEP_INTERVAL, {
            let breakers = Arc::clone(&self.breakers);
            move || {
                breakers.sweep();
                async {}.boxed()
            }
        });
        self.spawn_sweep("pool", POOL_SWEEP_INTERVAL, {
            let pool = Arc::clone(&self.pool);
            let memory = Arc::clone(&self.memory);
            let gc_hook = Arc::clone(&self.gc_hook);
            move || {
                let pool = Arc::clone(&pool);
                let memory = Arc::clone(&memory);
                let gc_hook = Arc::clone(&gc_hook);
                async move {
                    pool.cleanup_idle_connections().await;
                    if memory.stats().percentage > GC_HINT_PERCENTAGE {
                        if let Some(hook) = gc_hook.as_ref() {
                            let freed = hook();
                            log::debug!("pool sweep requested gc; freed {freed} bytes");
                        }
                    }
                }
                .boxed()
            }
        });
        self.memory.start_monitoring(MEMORY_MONITOR_INTERVAL);

        log::debug!("websocket runtime attached");
        true
    }

    fn spawn_sweep<F>(&self, name: &'static str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> futures_util::future::BoxFuture<'static, ()> + Send + 'static,
    {
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        log::trace!("{name} sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        });
    }

    fn largest_rate_limit_window(&self) -> Duration {
        self.config
            .routes
            .values()
            .filter_map(|overrides| overrides.rate_limit)
            .map(|rule| Duration::from_millis(rule.window_ms))
            .max()
            .unwrap_or(LIMITER_SWEEP_INTERVAL)
    }

    fn register_default_strategies(self: &Arc<Self>) {
        let gc_hook = Arc::clone(&self.gc_hook);
        self.memory.register_cleanup_strategy("request-gc", 10, move || {
            let gc_hook = Arc::clone(&gc_hook);
            async move { gc_hook.as_ref().as_ref().map_or(0, |hook| hook()) }.boxed()
        });

        let pool = Arc::clone(&self.pool);
        self.memory
            .register_cleanup_strategy("close-idle-connections", 9, move || {
                let pool = Arc::clone(&pool);
                async move {
                    let closed = pool.cleanup_idle_connections().await;
                    closed as u64 * ESTIMATED_CONNECTION_BYTES
                }
                .boxed()
            });

        let resolver = Arc::clone(&self.resolver);
        self.memory
            .register_cleanup_strategy("invalidate-pattern-cache", 6, move || {
                let resolver = Arc::clone(&resolver);
                async move { resolver.invalidate_compiled_patterns() }.boxed()
            });

        let pool = Arc::clone(&self.pool);
        self.memory
            .register_cleanup_strategy("reset-pool-metrics", 3, move || {
                let pool = Arc::clone(&pool);
                async move {
                    pool.reset_metrics();
                    0
                }
                .boxed()
            });
    }

    pub(crate) fn release_in_flight(&self, peer: Option<SocketAddr>) {
        if let Some(peer) = peer {
            self.tracker.unmark_in_flight(peer);
        }
    }

    fn refuse(error: &WebsocketError) -> AdmissionRejection {
        AdmissionRejection::Refused {
            status: error.http_status(),
            reason: close_frame_for(error).reason,
        }
    }

    /// Runs the admission pipeline.
    ///
    /// On `Ok`, the socket is marked in-flight and stays so until the
    /// connection's close path runs. Every `Err` path has already released
    /// the in-flight mark; no rejection leaves tracker or pool state
    /// behind.
    ///
    /// # Errors
    ///
    /// * [`AdmissionRejection`] describing how the transport layer should
    ///   dispose of the request
    pub async fn admit(
        &self,
        request: &AdmissionRequest<'_>,
    ) -> Result<Admission, AdmissionRejection> {
        if request.path.starts_with(INTERNAL_PREFIX) {
            return Err(AdmissionRejection::NotHandled);
        }

        if !self.config.enabled {
            return Err(Self::refuse(&WebsocketError::ServerNotAvailable(
                "websocket support is disabled".to_string(),
            )));
        }

        self.health.on_upgrade_attempt();

        if let Some(peer) = request.peer {
            if !self.tracker.mark_in_flight(peer) {
                log::debug!("ignoring upgrade for in-flight socket {peer}");
                return Err(AdmissionRejection::Ignored);
            }
        }

        let identity = client_identity(request.forwarded_for, request.real_ip, request.peer);

        if self.config.dedupe_rapid_upgrades
            && self.tracker.is_rapid_duplicate(request.path, &identity)
        {
            self.release_in_flight(request.peer);
            return Err(AdmissionRejection::Ignored);
        }

        let route_config = self.config.route_config(request.path);
        if let Some(rule) = route_config.rate_limit {
            let (admitted, info) = self.limiters.check(request.path, &identity, rule);
            if !admitted {
                self.release_in_flight(request.peer);
                self.health.on_upgrade_failure();
                log::debug!(
                    "refusing {identity} on {}: {}/{} requests in window",
                    request.path,
                    info.current,
                    info.limit
                );
                return Err(AdmissionRejection::Refused {
                    status: 429,
                    reason: "Too many requests".to_string(),
                });
            }
        }

        let route = match self.resolver.resolve(request.path) {
            Ok(route) => route,
            Err(err) => {
                self.release_in_flight(request.peer);
                self.health.on_upgrade_failure();
                return Err(Self::refuse(&err));
            }
        };

        // Origin is verified only for resolved routes, and a rejection
        // records nothing against the route's breaker.
        if !self.config.origin_allowed(request.origin) {
            self.release_in_flight(request.peer);
            self.health.on_upgrade_failure();
            return Err(AdmissionRejection::Refused {
                status: 403,
                reason: "Origin not allowed".to_string(),
            });
        }

        if !self.breakers.can_execute(&route.pattern) {
            self.release_in_flight(request.peer);
            self.health.on_upgrade_failure();
            return Err(AdmissionRejection::Refused {
                status: 503,
                reason: "Service temporarily unavailable".to_string(),
            });
        }

        match self.resolver.init_handler(&route, &self.server_handle()).await {
            Ok(handler) => Ok(Admission {
                route,
                handler,
                route_config,
                client_identity: identity,
            }),
            Err(err) => {
                // The handshake still completes so the client receives an
                // orderly close frame explaining the refusal.
                self.breakers.record_failure(&route.pattern, err.code());
                self.health.on_upgrade_failure();
                self.release_in_flight(request.peer);
                let frame = close_frame_for(&err);
                Err(AdmissionRejection::CloseAfterHandshake {
                    code: frame.code,
                    reason: frame.reason,
                })
            }
        }
    }

    fn connections_matching(&self, pattern: &str) -> usize {
        self.pool
            .connections_by_path("")
            .iter()
            .filter(|(_, meta)| pattern_matches(pattern, &meta.path))
            .count()
    }

    /// Completes an admitted upgrade: capacity and memory guards, handler
    /// invocation, then the connection loop until close. Runs as its own
    /// task, spawned by the transport layer.
    pub async fn attach_connection<S>(
        self: Arc<Self>,
        admission: Admission,
        path: String,
        peer: Option<SocketAddr>,
        sink: Arc<dyn ConnectionSink>,
        frames: S,
    ) where
        S: Stream<Item = Result<InboundFrame, BoxError>> + Unpin + 'static,
    {
        let id = Uuid::new_v4();
        let pattern = admission.route.pattern.clone();

        if !self.memory.acceptable() {
            log::warn!("refusing connection {id}: memory above maximum threshold");
            close_gracefully(
                sink.as_ref(),
                &CloseOptions::new(CLOSE_OVERLOADED, "Server overloaded"),
            )
            .await;
            self.breakers
                .record_failure(&pattern, WebsocketError::ConnectionLimit(0).code());
            self.health.on_upgrade_failure();
            self.release_in_flight(peer);
            return;
        }

        let at_route_capacity =
            self.connections_matching(&pattern) >= admission.route_config.max_connections;
        let added = if at_route_capacity {
            Err(WebsocketError::ConnectionLimit(self.pool.size()))
        } else {
            self.pool.add(id, Arc::clone(&sink), &path)
        };

        if let Err(err) = added {
            log::warn!("refusing connection {id}: {err}");
            close_gracefully(
                sink.as_ref(),
                &CloseOptions::new(CLOSE_OVERLOADED, "Server at capacity"),
            )
            .await;
            self.breakers.record_failure(&pattern, err.code());
            self.health.on_upgrade_failure();
            self.release_in_flight(peer);
            return;
        }

        self.health.on_open();

        let (client, forward) = WsClient::new(
            id,
            Arc::clone(&sink),
            Arc::clone(&self.pool),
            Arc::clone(&self.health),
        );
        let context = UpgradeContext {
            path: path.clone(),
            pattern: pattern.clone(),
            params: admission.route.params.clone(),
            client_identity: admission.client_identity.clone(),
        };

        let cleanup = match execute_handler_safely(&admission.handler, client, context).await {
            Ok(cleanup) => cleanup,
            Err(err) => {
                log::error!("connection handler for {pattern} failed: {err}");
                self.health.on_error();
                self.breakers.record_failure(&pattern, err.code());
                // Terminate without a close frame; drop the transport.
                if self.tracker.mark_cleaned(id) {
                    self.pool.remove(id);
                    self.health.on_close(Duration::ZERO);
                }
                self.release_in_flight(peer);
                return;
            }
        };

        self.breakers.record_success(&pattern);

        let deps = ConnectionDeps {
            pool: Arc::clone(&self.pool),
            tracker: Arc::clone(&self.tracker),
            health: Arc::clone(&self.health),
        };
        let params = ConnectionParams {
            id,
            path,
            peer,
            max_payload_size: self.config.security.max_payload_size,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        };
        run_connection(
            deps,
            params,
            sink,
            frames,
            forward,
            cleanup,
            self.token.child_token(),
        )
        .await;
    }

    /// Number of routes with an initialised (or tombstoned) factory.
    pub async fn cached_factory_count(&self) -> usize {
        self.resolver.cached_handler_count().await
    }

    #[must_use]
    pub fn health_inputs(&self) -> HealthInputs {
        HealthInputs {
            heap_percentage: self.memory.stats().percentage,
            any_breaker_open: self.breakers.any_open(),
            active_connections: self.pool.size(),
            max_connections: self.config.max_connections,
        }
    }

    /// The health endpoint payload and its roll-up status.
    #[must_use]
    pub fn health_payload(&self) -> (HealthStatus, serde_json::Value) {
        let status = self.health.status(&self.health_inputs());
        let counters = self.health.counters();
        let pool = self.pool.stats();
        let payload = serde_json::json!({
            "status": status,
            "uptimeSeconds": counters.uptime_seconds,
            "activeConnections": pool.active,
            "totalConnections": pool.total,
            "maxConnections": self.config.max_connections,
            "upgradesAttempted": counters.upgrades_attempted,
            "upgradesFailed": counters.upgrades_failed,
        });
        (status, payload)
    }

    /// The metrics endpoint payload.
    #[must_use]
    pub fn metrics_payload(&self) -> serde_json::Value {
        let per_path: Vec<serde_json::Value> = self
            .pool
            .connections_by_path("")
            .iter()
            .map(|(id, meta)| {
                serde_json::json!({
                    "id": id.to_string(),
                    "path": meta.path,
                    "messageCount": meta.message_count,
                    "bytesIn": meta.bytes_in,
                    "bytesOut": meta.bytes_out,
                })
            })
            .collect();

        serde_json::json!({
            "counters": self.health.counters(),
            "pool": self.pool.stats(),
            "memory": self.memory.generate_report(),
            "circuitBreakers": self.breakers.stats(),
            "connections": per_path,
        })
    }

    /// Tears the runtime down: stops sweeps and the memory monitor, closes
    /// every pooled connection with 1000/"Server shutdown", and clears all
    /// caches.
    pub async fn shutdown(&self) {
        log::debug!("shutting down websocket runtime");
        // Drain the pool before cancelling connection loops so every open
        // socket receives the shutdown close frame.
        self.memory.stop_monitoring();
        self.pool.destroy().await;
        self.token.cancel();
        self.resolver.clear().await;
        self.tracker.clear();
        self.limiters.clear();
        self.breakers.clear();
        self.attached.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        memory::MemorySample,
        router::{RouteModule, StaticModuleLoader},
    };

    struct FixedMemory(u64);

    impl MemorySource for FixedMemory {
        fn sample(&self) -> MemorySample {
            MemorySample {
                heap_used: self.0,
                heap_total: 100,
                rss: self.0,
            }
        }
    }

    fn echo_module() -> RouteModule {
        RouteModule::with_socket(Arc::new(|_server| {
            let handler: ConnectionHandler = Arc::new(|_client, _ctx| {
                async move {
                    Ok::<Option<crate::router::Cleanup>, BoxError>(None)
                }
                .boxed()
            });
            async move { Ok::<ConnectionHandler, BoxError>(handler) }.boxed()
        }))
    }

    fn runtime_with(config: WsConfig, pairs: &[(&str, &str)]) -> Arc<WsRuntime> {
        let loader = Arc::new(StaticModuleLoader::new());
        for (_, key) in pairs {
            loader.register(key, echo_module());
        }
        WsRuntime::with_parts(
            config,
            RouteTable::from_pairs(pairs),
            loader,
            Box::new(FixedMemory(10)),
            None,
        )
    }

    fn request(path: &str) -> AdmissionRequest<'_> {
        AdmissionRequest {
            path,
            peer: Some("9.9.9.9:1000".parse().unwrap()),
            forwarded_for: None,
            real_ip: None,
            origin: None,
        }
    }

    #[tokio::test]
    async fn internal_prefix_is_not_handled() {
        let runtime = runtime_with(WsConfig::default(), &[("/api/echo", "/api/echo/route")]);
        let rejection = runtime.admit(&request("/_trellis/hmr")).await.unwrap_err();
        assert_eq!(rejection, AdmissionRejection::NotHandled);
        assert_eq!(runtime.health.counters().upgrades_attempted, 0);
    }

    #[tokio::test]
    async fn disabled_runtime_refuses_with_503() {
        let config = WsConfig {
            enabled: false,
            ..WsConfig::default()
        };
        let runtime = runtime_with(config, &[("/api/echo", "/api/echo/route")]);

        let rejection = runtime.admit(&request("/api/echo")).await.unwrap_err();
        assert!(matches!(
            rejection,
            AdmissionRejection::Refused { status: 503, .. }
        ));
        assert!(!runtime.is_supported());
    }

    #[tokio::test]
    async fn unknown_route_refuses_with_404_and_no_breaker() {
        let runtime = runtime_with(WsConfig::default(), &[("/api/echo", "/api/echo/route")]);

        let rejection = runtime.admit(&request("/nope")).await.unwrap_err();
        assert!(matches!(
            rejection,
            AdmissionRejection::Refused { status: 404, .. }
        ));
        // Breakers are created only for resolved routes.
        assert_eq!(runtime.breakers.breaker_count(), 0);
        assert_eq!(runtime.tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn successful_admission_keeps_socket_in_flight() {
        let runtime = runtime_with(WsConfig::default(), &[("/api/echo", "/api/echo/route")]);

        let admission = runtime.admit(&request("/api/echo")).await.unwrap();
        assert_eq!(admission.route.pattern, "/api/echo");
        assert_eq!(runtime.tracker.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn in_flight_socket_is_ignored() {
        let runtime = runtime_with(WsConfig::default(), &[("/api/echo", "/api/echo/route")]);

        runtime.admit(&request("/api/echo")).await.unwrap();
        let rejection = runtime.admit(&request("/api/echo")).await.unwrap_err();
        assert_eq!(rejection, AdmissionRejection::Ignored);
    }

    #[tokio::test]
    async fn rapid_duplicate_from_distinct_socket_is_ignored() {
        let config = WsConfig {
            dedupe_rapid_upgrades: true,
            ..WsConfig::default()
        };
        let runtime = runtime_with(config, &[("/api/echo", "/api/echo/route")]);

        let mut first = request("/api/echo");
        first.peer = Some("9.9.9.9:1000".parse().unwrap());
        runtime.admit(&first).await.unwrap();

        // Same client identity (ip), different socket (port).
        let mut second = request("/api/echo");
        second.peer = Some("9.9.9.9:1001".parse().unwrap());
        let rejection = runtime.admit(&second).await.unwrap_err();
        assert_eq!(rejection, AdmissionRejection::Ignored);
        // The rejected socket must not stay marked.
        assert_eq!(runtime.tracker.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn origin_rejection_refuses_with_403_and_no_breaker() {
        let mut config = WsConfig::default();
        config.security.origins = Some(vec!["https://app.example".to_string()]);
        let runtime = runtime_with(config, &[("/api/echo", "/api/echo/route")]);

        let mut req = request("/api/echo");
        req.origin = Some("https://evil.example");
        let rejection = runtime.admit(&req).await.unwrap_err();
        assert!(matches!(
            rejection,
            AdmissionRejection::Refused { status: 403, .. }
        ));
        assert_eq!(runtime.breakers.breaker_count(), 0);
        assert_eq!(runtime.tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn origin_is_checked_after_route_resolution() {
        let mut config = WsConfig::default();
        config.security.origins = Some(vec!["https://app.example".to_string()]);
        let runtime = runtime_with(config, &[("/api/echo", "/api/echo/route")]);

        // An unresolvable path reports the route failure, not the origin.
        let mut req = request("/nope");
        req.origin = Some("https://evil.example");
        let rejection = runtime.admit(&req).await.unwrap_err();
        assert!(matches!(
            rejection,
            AdmissionRejection::Refused { status: 404, .. }
        ));

        let mut req = request("/api/echo");
        req.peer = Some("9.9.9.9:1001".parse().unwrap());
        req.origin = Some("https://evil.example");
        let rejection = runtime.admit(&req).await.unwrap_err();
        assert!(matches!(
            rejection,
            AdmissionRejection::Refused { status: 403, .. }
        ));
    }

    #[tokio::test]
    async fn factory_failure_closes_after_handshake_and_trips_breaker() {
        let loader = Arc::new(StaticModuleLoader::new());
        loader.register(
            "/api/bad/route",
            RouteModule::with_socket(Arc::new(|_server| {
                async move { Err::<ConnectionHandler, BoxError>("boom".into()) }.boxed()
            })),
        );
        let runtime = WsRuntime::with_parts(
            WsConfig::default(),
            RouteTable::from_pairs(&[("/api/bad", "/api/bad/route")]),
            loader,
            Box::new(FixedMemory(10)),
            None,
        );

        for port in [2000, 2001] {
            let mut req = request("/api/bad");
            req.peer = Some(format!("9.9.9.9:{port}").parse().unwrap());
            let rejection = runtime.admit(&req).await.unwrap_err();
            assert_eq!(
                rejection,
                AdmissionRejection::CloseAfterHandshake {
                    code: 1002,
                    reason: "Handler not available".to_string(),
                }
            );
        }

        let stats = runtime.breakers.stats();
        assert_eq!(stats.get("/api/bad").unwrap().windowed_failures, 2);
        assert_eq!(runtime.tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn double_setup_is_noop() {
        let runtime = runtime_with(WsConfig::default(), &[("/api/echo", "/api/echo/route")]);
        assert!(runtime.setup());
        assert!(!runtime.setup());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn memory_pressure_closes_with_1013() {
        let loader = Arc::new(StaticModuleLoader::new());
        loader.register("/api/echo/route", echo_module());
        let runtime = WsRuntime::with_parts(
            WsConfig::default(),
            RouteTable::from_pairs(&[("/api/echo", "/api/echo/route")]),
            loader,
            Box::new(FixedMemory(99)),
            None,
        );

        let admission = runtime.admit(&request("/api/echo")).await.unwrap();
        let sink = Arc::new(crate::pool::test_support::RecordingSink::new());
        let frames = futures_util::stream::pending::<Result<InboundFrame, BoxError>>();

        Arc::clone(&runtime)
            .attach_connection(
                admission,
                "/api/echo".to_string(),
                request("/api/echo").peer,
                sink.clone(),
                frames,
            )
            .await;

        assert_eq!(
            sink.recorded(),
            vec![crate::pool::test_support::SinkEvent::Close(
                CLOSE_OVERLOADED,
                "Server overloaded".to_string()
            )]
        );
        assert_eq!(runtime.pool.size(), 0);
        assert_eq!(runtime.tracker.in_flight_count(), 0);
    }
}
