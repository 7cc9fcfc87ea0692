#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Logging initialization for `Trellis` binaries.

pub use log;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("Logger was already initialized")]
    AlreadyInitialized,
}

/// Initializes the process logger.
///
/// The filter is taken from `TRELLIS_LOG`, falling back to `RUST_LOG`, then
/// to a build-dependent default (`trellis=debug` in debug builds,
/// `trellis=info` otherwise).
///
/// # Errors
///
/// * If a logger has already been installed for this process
pub fn init() -> Result<(), InitError> {
    #[cfg(debug_assertions)]
    const DEFAULT_LOG_LEVEL: &str = "trellis=debug";
    #[cfg(not(debug_assertions))]
    const DEFAULT_LOG_LEVEL: &str = "trellis=info";

    let filter = std::env::var("TRELLIS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    env_logger::Builder::new()
        .parse_filters(&filter)
        .try_init()
        .map_err(|_| InitError::AlreadyInitialized)
}
