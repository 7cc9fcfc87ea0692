#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! WebSocket runtime for the `Trellis` framework.
//!
//! Accepts HTTP upgrade requests on the application's shared listening
//! socket, resolves each request against the app-router table to a
//! user-supplied connection factory, and manages the lifetime of the
//! resulting long-lived connection: admission control (deduplication, rate
//! limiting, circuit breaking, memory and capacity guards), per-connection
//! heartbeat and cleanup, shared connection pool with broadcast and idle
//! reaping, and an HTTP health/metrics surface.
//!
//! # Main Components
//!
//! * [`WsRuntime`] - the upgrade orchestrator owning every singleton
//! * [`RouteTable`] / [`ModuleLoader`] - the app-router table and the
//!   capability that loads route modules by key
//! * [`RouteModule`] - the enumerated module layouts a route may export
//! * [`WsClient`] - the per-client handle passed to connection handlers
//! * [`WsConfig`] - layered configuration (defaults ⊕ file ⊕ environment)
//! * [`api`] - actix-web mounting: upgrade entry point, health, metrics
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures_util::FutureExt;
//! use trellis_ws::{
//!     BoxError, Cleanup, ConnectionHandler, RouteModule, RouteTable,
//!     StaticModuleLoader, WsConfig, WsRuntime,
//! };
//!
//! let loader = Arc::new(StaticModuleLoader::new());
//! loader.register(
//!     "/api/echo/route",
//!     RouteModule::with_socket(Arc::new(|_server| {
//!         let handler: ConnectionHandler = Arc::new(|client, _request| {
//!             async move {
//!                 tokio::spawn(async move {
//!                     while let Some(message) = client.recv().await {
//!                         if let trellis_ws::ClientMessage::Text(text) = message {
//!                             let _ = client.send(&text).await;
//!                         }
//!                     }
//!                 });
//!                 Ok::<Option<Cleanup>, BoxError>(None)
//!             }
//!             .boxed()
//!         });
//!         async move { Ok::<ConnectionHandler, BoxError>(handler) }.boxed()
//!     })),
//! );
//!
//! let table = RouteTable::from_pairs(&[("/api/echo", "/api/echo/route")]);
//! let runtime = WsRuntime::new(WsConfig::default(), table, loader);
//! runtime.setup();
//! ```

pub mod api;
pub mod breaker;
pub mod config;
pub mod error;
pub mod graceful;
pub mod handler;
pub mod health;
pub mod memory;
pub mod pool;
pub mod rate_limiter;
pub mod router;
pub mod tracker;
pub mod upgrade;

pub use config::{WsConfig, WsConfigOverlay};
pub use error::{ErrorCode, RecoveryAction, WebsocketError};
pub use handler::{ClientMessage, WsClient};
pub use pool::{ConnectionId, ConnectionPool, ConnectionSink, ServerHandle};
pub use router::{
    BoxError, Cleanup, ConnectionHandler, ModuleLoader, RouteModule, RouteTable, SocketFactory,
    StaticModuleLoader, UpgradeContext,
};
pub use upgrade::{AdmissionRejection, AdmissionRequest, WsRuntime};
