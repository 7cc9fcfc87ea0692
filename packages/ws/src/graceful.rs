//! Graceful connection teardown.
//!
//! Closing always has a bounded wait: the orderly close frame is attempted
//! under a timeout, after which the caller falls back to dropping the
//! transport. User code (handlers and their cleanup callbacks) is isolated
//! so neither an error return nor a panic can take the runtime down.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;

use crate::{
    error::{RecoveryAction, WebsocketError},
    handler::WsClient,
    pool::ConnectionSink,
    router::{Cleanup, ConnectionHandler, UpgradeContext},
};

/// Bounded wait for an orderly close before forcing termination.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CloseOptions {
    pub code: u16,
    pub reason: String,
    pub timeout: Duration,
}

impl CloseOptions {
    #[must_use]
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// The close frame for a post-handshake failure. Reasons are short and
/// human-readable; no internals leak to the client.
#[must_use]
pub fn close_frame_for(error: &WebsocketError) -> CloseOptions {
    let reason = match error {
        WebsocketError::RouteNotFound(_) => "Route not found",
        WebsocketError::HandlerNotFound(_) => "Handler not available",
        WebsocketError::ServerNotAvailable(_) => "Service unavailable",
        WebsocketError::ConnectionLimit(_) => "Server at capacity",
        WebsocketError::ModuleImport { .. } | WebsocketError::HandlerExecution(_) => {
            "Internal server error"
        }
    };
    CloseOptions::new(error.close_code(), reason)
}

/// Attempts an orderly close bounded by the options' timeout. Returns
/// `false` when the graceful path failed or timed out and the caller
/// should drop the transport.
pub async fn close_gracefully(sink: &dyn ConnectionSink, options: &CloseOptions) -> bool {
    match tokio::time::timeout(options.timeout, sink.close(options.code, &options.reason)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            log::debug!("graceful close failed: {err:?}");
            false
        }
        Err(_) => {
            log::warn!(
                "graceful close timed out after {:?}; terminating",
                options.timeout
            );
            false
        }
    }
}

/// Routes a post-handshake error to its recovery action, sending the close
/// frame when the verdict allows one. `Retry` is reserved and treated as
/// terminate.
pub async fn handle_connection_error(
    sink: &dyn ConnectionSink,
    error: &WebsocketError,
) -> RecoveryAction {
    match error.recovery() {
        RecoveryAction::CloseConnection => {
            close_gracefully(sink, &close_frame_for(error)).await;
            RecoveryAction::CloseConnection
        }
        RecoveryAction::TerminateConnection | RecoveryAction::Retry => {
            RecoveryAction::TerminateConnection
        }
        RecoveryAction::Ignore => RecoveryAction::Ignore,
    }
}

/// Invokes a connection handler with panic isolation.
///
/// # Errors
///
/// * [`WebsocketError::HandlerExecution`] if the handler returned an error
///   or panicked
pub async fn execute_handler_safely(
    handler: &ConnectionHandler,
    client: Arc<WsClient>,
    context: UpgradeContext,
) -> Result<Option<Cleanup>, WebsocketError> {
    match AssertUnwindSafe(handler(client, context)).catch_unwind().await {
        Ok(Ok(cleanup)) => Ok(cleanup),
        Ok(Err(err)) => Err(WebsocketError::HandlerExecution(err.to_string())),
        Err(_) => Err(WebsocketError::HandlerExecution(
            "connection handler panicked".to_string(),
        )),
    }
}

/// Runs a user cleanup callback, swallowing and logging any panic.
pub fn run_cleanup_safely(cleanup: Cleanup) {
    if std::panic::catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
        log::error!("connection cleanup callback panicked");
    }
}
