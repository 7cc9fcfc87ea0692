//! Route resolution and connection-factory initialisation.
//!
//! The app-router table maps URL patterns to module keys; only keys ending
//! in the route-file suffix are upgrade candidates. Static patterns are
//! matched exactly; parameterised patterns (`[param]` segments) are
//! compiled once, cached, and tested in declaration order. A resolved
//! route's module is fetched through the [`ModuleLoader`] capability and
//! probed for its socket export across the known module layouts. The
//! factory behind that export runs at most once per route per process
//! lifetime; a failed invocation leaves a tombstone so later upgrades fail
//! fast without re-running user code.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    error::WebsocketError,
    handler::WsClient,
    pool::ServerHandle,
};

/// Module keys must end in this suffix to be upgrade candidates.
pub const ROUTE_FILE_SUFFIX: &str = "/route";
/// Well-known name of the upgrade export inside a `handlers` map.
pub const SOCKET_EXPORT: &str = "socket";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
/// Optional callback a connection handler may return, run once on close.
pub type Cleanup = Box<dyn FnOnce() + Send>;
pub type HandlerFuture = BoxFuture<'static, Result<Option<Cleanup>, BoxError>>;
/// Per-client handler: called once per admitted connection.
pub type ConnectionHandler = Arc<dyn Fn(Arc<WsClient>, UpgradeContext) -> HandlerFuture + Send + Sync>;
pub type FactoryFuture = BoxFuture<'static, Result<ConnectionHandler, BoxError>>;
/// Per-route factory: called at most once per process lifetime.
pub type SocketFactory = Arc<dyn Fn(ServerHandle) -> FactoryFuture + Send + Sync>;

/// Request details handed to the connection handler.
#[derive(Debug, Clone)]
pub struct UpgradeContext {
    pub path: String,
    pub pattern: String,
    pub params: BTreeMap<String, String>,
    pub client_identity: String,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub pattern: String,
    pub module_key: String,
}

/// Read-only app-router table, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    #[must_use]
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(pattern, key)| RouteEntry {
                    pattern: (*pattern).to_string(),
                    module_key: (*key).to_string(),
                })
                .collect(),
        )
    }

    fn candidates(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.module_key.ends_with(ROUTE_FILE_SUFFIX))
    }

    #[must_use]
    pub fn has_candidates(&self) -> bool {
        self.candidates().next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    segments: Vec<PatternSegment>,
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                segment
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .map_or_else(
                        || PatternSegment::Literal(segment.to_string()),
                        |name| PatternSegment::Param(name.to_string()),
                    )
            })
            .collect();
        Self { segments }
    }

    fn match_path(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (expected, actual) in self.segments.iter().zip(&segments) {
            match expected {
                PatternSegment::Literal(literal) => {
                    if literal != actual {
                        return None;
                    }
                }
                PatternSegment::Param(name) => {
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(params)
    }
}

fn is_parameterized(pattern: &str) -> bool {
    pattern.contains('[')
}

/// Whether `pattern` (static or parameterised) matches `path`. Used by the
/// config layer to find per-route overrides for a concrete request path.
#[must_use]
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if is_parameterized(pattern) {
        CompiledPattern::compile(pattern).match_path(path).is_some()
    } else {
        pattern == path || pattern.trim_end_matches('/') == path.trim_end_matches('/')
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub pattern: String,
    pub module_key: String,
    pub params: BTreeMap<String, String>,
}

/// Loads route modules by key. Production wires the framework's compiled
/// module registry; tests register modules directly.
pub trait ModuleLoader: Send + Sync {
    /// Resolves the on-disk path for a module key, if known.
    fn resolve_page_path(&self, key: &str) -> Option<String>;

    /// Triggers a compile for the page in development.
    ///
    /// # Errors
    ///
    /// * If the page cannot be prepared
    fn ensure_page(&self, _key: &str) -> Result<(), BoxError> {
        Ok(())
    }

    /// Loads the module's exports.
    ///
    /// # Errors
    ///
    /// * If the loader fails or the key is unknown
    fn load_module(&self, key: &str) -> Result<RouteModule, BoxError>;
}

/// In-memory loader over pre-registered modules.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: Mutex<HashMap<String, RouteModule>>,
}

impl StaticModuleLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// * If the module map `Mutex` is poisoned
    pub fn register(&self, key: &str, module: RouteModule) {
        self.modules.lock().unwrap().insert(key.to_string(), module);
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn resolve_page_path(&self, key: &str) -> Option<String> {
        self.modules
            .lock()
            .unwrap()
            .contains_key(key)
            .then(|| key.to_string())
    }

    fn load_module(&self, key: &str) -> Result<RouteModule, BoxError> {
        self.modules
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| format!("module '{key}' is not registered").into())
    }
}

/// Exports nested under the framework's route-handler slot.
#[derive(Clone, Default)]
pub struct RouteHandlerExports {
    pub socket: Option<SocketFactory>,
}

/// The enumerated module layouts the resolver understands. The socket
/// export may appear nested under the route-handler slot, at the top
/// level, or inside a conventional `handlers` map; the same lookup is
/// applied once more through a single level of default-export indirection.
#[derive(Clone, Default)]
pub struct RouteModule {
    pub route_handler: Option<RouteHandlerExports>,
    pub socket: Option<SocketFactory>,
    pub handlers: Option<HashMap<String, SocketFactory>>,
    pub default_export: Option<Box<RouteModule>>,
}

impl RouteModule {
    #[must_use]
    pub fn with_socket(factory: SocketFactory) -> Self {
        Self {
            socket: Some(factory),
            ..Self::default()
        }
    }

    fn direct_socket_export(&self) -> Option<SocketFactory> {
        self.route_handler
            .as_ref()
            .and_then(|nest| nest.socket.clone())
            .or_else(|| self.socket.clone())
            .or_else(|| {
                self.handlers
                    .as_ref()
                    .and_then(|map| map.get(SOCKET_EXPORT).cloned())
            })
    }

    /// Finds the socket export across the known layouts.
    ///
    /// # Errors
    ///
    /// * If a default export nests another default export
    pub fn socket_export(&self) -> Result<Option<SocketFactory>, WebsocketError> {
        if let Some(factory) = self.direct_socket_export() {
            return Ok(Some(factory));
        }
        if let Some(default) = &self.default_export {
            if default.default_export.is_some() {
                return Err(WebsocketError::ModuleImport {
                    key: String::new(),
                    message: "default export nests another default export".to_string(),
                });
            }
            return Ok(default.direct_socket_export());
        }
        Ok(None)
    }
}

enum HandlerInit {
    Ready(ConnectionHandler),
    Failed,
}

/// Resolves URLs against the route table and owns the one-shot factory
/// cache.
pub struct RouteResolver {
    table: RouteTable,
    loader: Arc<dyn ModuleLoader>,
    compiled: Mutex<HashMap<String, CompiledPattern>>,
    handlers: tokio::sync::Mutex<HashMap<String, HandlerInit>>,
}

impl RouteResolver {
    #[must_use]
    pub fn new(table: RouteTable, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            table,
            loader,
            compiled: Mutex::new(HashMap::new()),
            handlers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn has_candidates(&self) -> bool {
        self.table.has_candidates()
    }

    /// Resolves a request path to its route. Pure: the same table and path
    /// always yield the same result.
    ///
    /// # Errors
    ///
    /// * [`WebsocketError::RouteNotFound`] if nothing matches
    ///
    /// # Panics
    ///
    /// * If the compiled-pattern `Mutex` is poisoned
    pub fn resolve(&self, path: &str) -> Result<ResolvedRoute, WebsocketError> {
        // Static candidates match exactly, before any parameterised route.
        for entry in self.table.candidates() {
            if !is_parameterized(&entry.pattern) && pattern_matches(&entry.pattern, path) {
                return Ok(ResolvedRoute {
                    pattern: entry.pattern.clone(),
                    module_key: entry.module_key.clone(),
                    params: BTreeMap::new(),
                });
            }
        }

        for entry in self.table.candidates() {
            if !is_parameterized(&entry.pattern) {
                continue;
            }
            let params = {
                let mut compiled = self.compiled.lock().unwrap();
                compiled
                    .entry(entry.pattern.clone())
                    .or_insert_with(|| CompiledPattern::compile(&entry.pattern))
                    .match_path(path)
            };
            if let Some(params) = params {
                return Ok(ResolvedRoute {
                    pattern: entry.pattern.clone(),
                    module_key: entry.module_key.clone(),
                    params,
                });
            }
        }

        Err(WebsocketError::RouteNotFound(path.to_string()))
    }

    /// Returns the route's connection handler, invoking its factory on the
    /// first call and caching the outcome. A failed factory leaves a
    /// tombstone: later calls fail with `HandlerNotFound` without touching
    /// user code again.
    ///
    /// # Errors
    ///
    /// * [`WebsocketError::ModuleImport`] if the loader fails or the module
    ///   shape is invalid
    /// * [`WebsocketError::HandlerNotFound`] if the module lacks the socket
    ///   export or its factory previously failed
    pub async fn init_handler(
        &self,
        route: &ResolvedRoute,
        server: &ServerHandle,
    ) -> Result<ConnectionHandler, WebsocketError> {
        // The lock is held across factory invocation so concurrent
        // upgrades for the same route cannot run the factory twice.
        let mut cache = self.handlers.lock().await;

        match cache.get(&route.pattern) {
            Some(HandlerInit::Ready(handler)) => return Ok(Arc::clone(handler)),
            Some(HandlerInit::Failed) => {
                return Err(WebsocketError::HandlerNotFound(route.pattern.clone()));
            }
            None => {}
        }

        self.loader
            .ensure_page(&route.module_key)
            .map_err(|err| WebsocketError::ModuleImport {
                key: route.module_key.clone(),
                message: err.to_string(),
            })?;

        let module =
            self.loader
                .load_module(&route.module_key)
                .map_err(|err| WebsocketError::ModuleImport {
                    key: route.module_key.clone(),
                    message: err.to_string(),
                })?;

        let factory = match module.socket_export() {
            Ok(Some(factory)) => factory,
            Ok(None) => {
                cache.insert(route.pattern.clone(), HandlerInit::Failed);
                return Err(WebsocketError::HandlerNotFound(route.pattern.clone()));
            }
            Err(WebsocketError::ModuleImport { message, .. }) => {
                cache.insert(route.pattern.clone(), HandlerInit::Failed);
                return Err(WebsocketError::ModuleImport {
                    key: route.module_key.clone(),
                    message,
                });
            }
            Err(other) => return Err(other),
        };

        log::debug!("initialising connection factory for {}", route.pattern);
        let invocation = std::panic::AssertUnwindSafe(factory(server.clone()))
            .catch_unwind()
            .await;

        match invocation {
            Ok(Ok(handler)) => {
                cache.insert(route.pattern.clone(), HandlerInit::Ready(Arc::clone(&handler)));
                Ok(handler)
            }
            Ok(Err(err)) => {
                log::error!("connection factory for {} failed: {err}", route.pattern);
                cache.insert(route.pattern.clone(), HandlerInit::Failed);
                Err(WebsocketError::HandlerNotFound(route.pattern.clone()))
            }
            Err(_) => {
                log::error!("connection factory for {} panicked", route.pattern);
                cache.insert(route.pattern.clone(), HandlerInit::Failed);
                Err(WebsocketError::HandlerNotFound(route.pattern.clone()))
            }
        }
    }

    /// Drops the compiled-pattern cache. Optional memory-pressure relief;
    /// the factory cache is never invalidated this way.
    ///
    /// # Panics
    ///
    /// * If the compiled-pattern `Mutex` is poisoned
    pub fn invalidate_compiled_patterns(&self) -> u64 {
        let mut compiled = self.compiled.lock().unwrap();
        let count = compiled.len() as u64;
        compiled.clear();
        // Rough footprint of a compiled pattern.
        count * 256
    }

    /// Clears every cache. Called on server shutdown.
    ///
    /// # Panics
    ///
    /// * If the compiled-pattern `Mutex` is poisoned
    pub async fn clear(&self) {
        self.compiled.lock().unwrap().clear();
        self.handlers.lock().await.clear();
    }

    #[must_use]
    pub async fn cached_handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }
}
