//! WebSocket runtime error taxonomy.
//!
//! Every failure the runtime can surface maps to one of a closed set of
//! kinds, each with a stable code, an advisory HTTP status for
//! pre-handshake rejections, a close code for post-handshake closures, and
//! a recovery verdict. All mappings are pure functions of the error kind.

use serde::Serialize;
use strum_macros::AsRefStr;
use thiserror::Error;

/// Close a WebSocket connection normally.
pub const CLOSE_NORMAL: u16 = 1000;
/// Protocol-level failure (route or handler absent).
pub const CLOSE_PROTOCOL: u16 = 1002;
/// Internal server error.
pub const CLOSE_INTERNAL: u16 = 1011;
/// Server overloaded or at capacity.
pub const CLOSE_OVERLOADED: u16 = 1013;

/// Errors raised by the upgrade pipeline and connection lifecycle.
#[derive(Debug, Error)]
pub enum WebsocketError {
    /// The request URL did not match any route in the app-router table.
    #[error("No route matched path '{0}'")]
    RouteNotFound(String),

    /// The matched route module does not expose the socket export.
    #[error("Route '{0}' has no socket export")]
    HandlerNotFound(String),

    /// The module loader failed or returned nothing usable.
    #[error("Failed to load module '{key}': {message}")]
    ModuleImport { key: String, message: String },

    /// The host server or route table is not reachable.
    #[error("WebSocket server not available: {0}")]
    ServerNotAvailable(String),

    /// The connection pool is at capacity.
    #[error("Connection limit exceeded: {0} active connections")]
    ConnectionLimit(usize),

    /// The user-supplied handler returned an error or panicked.
    #[error("Handler execution failed: {0}")]
    HandlerExecution(String),
}

/// Stable error codes exposed in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RouteNotFound,
    HandlerNotFound,
    ModuleImportError,
    ServerNotAvailable,
    ConnectionLimitExceeded,
    HandlerExecutionError,
}

/// What the runtime does with the connection after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    /// Send an orderly close frame with a protocol-level code.
    CloseConnection,
    /// Tear the connection down without a close frame.
    TerminateConnection,
    /// Reserved; treated as [`Self::TerminateConnection`] until implemented.
    Retry,
    /// Take no action.
    Ignore,
}

impl WebsocketError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RouteNotFound(_) => ErrorCode::RouteNotFound,
            Self::HandlerNotFound(_) => ErrorCode::HandlerNotFound,
            Self::ModuleImport { .. } => ErrorCode::ModuleImportError,
            Self::ServerNotAvailable(_) => ErrorCode::ServerNotAvailable,
            Self::ConnectionLimit(_) => ErrorCode::ConnectionLimitExceeded,
            Self::HandlerExecution(_) => ErrorCode::HandlerExecutionError,
        }
    }

    /// Advisory HTTP status for rejections that never complete the
    /// handshake.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::RouteNotFound(_) => 404,
            Self::HandlerNotFound(_) => 400,
            Self::ModuleImport { .. } | Self::HandlerExecution(_) => 500,
            Self::ServerNotAvailable(_) => 503,
            Self::ConnectionLimit(_) => 429,
        }
    }

    /// Close code for failures surfaced after the handshake completed.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::RouteNotFound(_) | Self::HandlerNotFound(_) | Self::ServerNotAvailable(_) => {
                CLOSE_PROTOCOL
            }
            Self::ModuleImport { .. } | Self::HandlerExecution(_) => CLOSE_INTERNAL,
            Self::ConnectionLimit(_) => CLOSE_OVERLOADED,
        }
    }

    #[must_use]
    pub const fn recovery(&self) -> RecoveryAction {
        match self {
            Self::RouteNotFound(_)
            | Self::HandlerNotFound(_)
            | Self::ServerNotAvailable(_)
            | Self::ConnectionLimit(_) => RecoveryAction::CloseConnection,
            Self::ModuleImport { .. } | Self::HandlerExecution(_) => {
                RecoveryAction::TerminateConnection
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::RouteNotFound.as_ref(), "ROUTE_NOT_FOUND");
        assert_eq!(ErrorCode::HandlerNotFound.as_ref(), "HANDLER_NOT_FOUND");
        assert_eq!(ErrorCode::ModuleImportError.as_ref(), "MODULE_IMPORT_ERROR");
        assert_eq!(ErrorCode::ServerNotAvailable.as_ref(), "SERVER_NOT_AVAILABLE");
        assert_eq!(
            ErrorCode::ConnectionLimitExceeded.as_ref(),
            "CONNECTION_LIMIT_EXCEEDED"
        );
        assert_eq!(
            ErrorCode::HandlerExecutionError.as_ref(),
            "HANDLER_EXECUTION_ERROR"
        );
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(WebsocketError::RouteNotFound("/x".into()).http_status(), 404);
        assert_eq!(WebsocketError::HandlerNotFound("/x".into()).http_status(), 400);
        assert_eq!(
            WebsocketError::ModuleImport {
                key: "k".into(),
                message: "m".into()
            }
            .http_status(),
            500
        );
        assert_eq!(
            WebsocketError::ServerNotAvailable("down".into()).http_status(),
            503
        );
        assert_eq!(WebsocketError::ConnectionLimit(10).http_status(), 429);
        assert_eq!(
            WebsocketError::HandlerExecution("boom".into()).http_status(),
            500
        );
    }

    #[test]
    fn recovery_is_deterministic() {
        assert_eq!(
            WebsocketError::RouteNotFound("/x".into()).recovery(),
            RecoveryAction::CloseConnection
        );
        assert_eq!(
            WebsocketError::ConnectionLimit(1).recovery(),
            RecoveryAction::CloseConnection
        );
        assert_eq!(
            WebsocketError::HandlerExecution("boom".into()).recovery(),
            RecoveryAction::TerminateConnection
        );
        assert_eq!(
            WebsocketError::ModuleImport {
                key: "k".into(),
                message: "m".into()
            }
            .recovery(),
            RecoveryAction::TerminateConnection
        );
    }

    #[test]
    fn close_codes_match_failure_class() {
        assert_eq!(
            WebsocketError::HandlerNotFound("/x".into()).close_code(),
            CLOSE_PROTOCOL
        );
        assert_eq!(
            WebsocketError::HandlerExecution("boom".into()).close_code(),
            CLOSE_INTERNAL
        );
        assert_eq!(WebsocketError::ConnectionLimit(1).close_code(), CLOSE_OVERLOADED);
    }
}
