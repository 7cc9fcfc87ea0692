#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Reference server wiring the WebSocket runtime into an actix-web host.
//!
//! Registers a demo echo route so the full pipeline (admission, factory
//! init, heartbeat, cleanup, health surface) can be exercised end to end:
//!
//! ```sh
//! PORT=8000 trellis_server
//! websocat ws://localhost:8000/api/echo
//! ```

use std::{path::Path, sync::Arc};

use actix_web::{middleware, App};
use futures_util::FutureExt;
use trellis_env_utils::{default_env, default_env_u16};
use trellis_ws::{
    api, BoxError, Cleanup, ClientMessage, ConnectionHandler, RouteModule, RouteTable,
    StaticModuleLoader, WsConfig, WsRuntime,
};

/// Demo route module: echoes every text message back to the client.
fn echo_module() -> RouteModule {
    RouteModule::with_socket(Arc::new(|_server| {
        log::info!("echo route factory initialised");
        let handler: ConnectionHandler = Arc::new(|client, request| {
            async move {
                log::info!(
                    "client {} connected to {} ({})",
                    client.id(),
                    request.path,
                    request.client_identity
                );
                let id = client.id();
                let echo = Arc::clone(&client);
                tokio::spawn(async move {
                    while let Some(message) = echo.recv().await {
                        match message {
                            ClientMessage::Text(text) => {
                                if echo.send(&text).await.is_err() {
                                    break;
                                }
                            }
                            ClientMessage::Binary(data) => {
                                if echo.send_binary(&data).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                let cleanup: Cleanup = Box::new(move || {
                    log::info!("client {id} disconnected");
                });
                Ok::<Option<Cleanup>, BoxError>(Some(cleanup))
            }
            .boxed()
        });
        async move { Ok::<ConnectionHandler, BoxError>(handler) }.boxed()
    }))
}

fn main() -> Result<(), std::io::Error> {
    trellis_logging::init().expect("Failed to initialize logging");

    let service_port = default_env_u16("PORT", 8000).unwrap_or(8000);

    actix_web::rt::System::new().block_on(async move {
        let config_path = std::env::var("TRELLIS_WS_CONFIG").ok();
        let config = WsConfig::load(config_path.as_deref().map(Path::new));

        let loader = Arc::new(StaticModuleLoader::new());
        loader.register("/api/echo/route", echo_module());
        let table = RouteTable::from_pairs(&[("/api/echo", "/api/echo/route")]);

        let runtime = WsRuntime::new(config, table, loader);
        runtime.setup();

        let app_runtime = Arc::clone(&runtime);
        let http_server = actix_web::HttpServer::new(move || {
            let runtime = Arc::clone(&app_runtime);
            App::new()
                .wrap(middleware::Compress::default())
                .configure(move |cfg| api::configure(cfg, &runtime))
        })
        .bind((default_env("BIND_ADDR", "0.0.0.0"), service_port))?
        .run();

        log::info!("listening on port {service_port}");
        let resp = http_server.await;

        log::debug!("Shutting down ws runtime...");
        runtime.shutdown().await;
        log::debug!("Server shut down");

        resp
    })
}
