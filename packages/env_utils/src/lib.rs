#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Environment variable parsing helpers for `Trellis`.
//!
//! Typed accessors over `std::env::var` used by the configuration layer and
//! server binaries. The `option_env_*` family distinguishes "not set" from
//! "set but invalid" so callers can discard invalid tokens without aborting.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvUsizeError {
    #[error(transparent)]
    Var(#[from] std::env::VarError),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
}

/// # Errors
///
/// * If the environment variable is missing
/// * If the value is not a valid `usize`
pub fn env_usize(name: &str) -> Result<usize, EnvUsizeError> {
    Ok(std::env::var(name)?.parse::<usize>()?)
}

#[derive(Error, Debug)]
pub enum OptionEnvUsizeError {
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
}

/// # Errors
///
/// * If the value is set but is not a valid `usize`
pub fn option_env_usize(name: &str) -> Result<Option<usize>, OptionEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value.parse::<usize>()?)),
        Err(_) => Ok(None),
    }
}

/// # Errors
///
/// * If the value is set but is not a valid `u64`
pub fn option_env_u64(name: &str) -> Result<Option<u64>, OptionEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value.parse::<u64>()?)),
        Err(_) => Ok(None),
    }
}

/// # Errors
///
/// * If the value is set but is not a valid `u16`
pub fn option_env_u16(name: &str) -> Result<Option<u16>, OptionEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value.parse::<u16>()?)),
        Err(_) => Ok(None),
    }
}

#[derive(Error, Debug)]
pub enum OptionEnvBoolError {
    #[error("Invalid boolean token '{0}'")]
    InvalidToken(String),
}

/// Parses a boolean environment variable.
///
/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive).
///
/// # Errors
///
/// * If the value is set but is not one of the accepted tokens
pub fn option_env_bool(name: &str) -> Result<Option<bool>, OptionEnvBoolError> {
    let Ok(value) = std::env::var(name) else {
        return Ok(None);
    };
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(OptionEnvBoolError::InvalidToken(value)),
    }
}

/// # Errors
///
/// * If the value is set but is not a valid `usize`
pub fn default_env_usize(name: &str, default: usize) -> Result<usize, OptionEnvUsizeError> {
    Ok(option_env_usize(name)?.unwrap_or(default))
}

/// # Errors
///
/// * If the value is set but is not a valid `u16`
pub fn default_env_u16(name: &str, default: u16) -> Result<u16, OptionEnvUsizeError> {
    Ok(option_env_u16(name)?.unwrap_or(default))
}

#[must_use]
pub fn default_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[macro_export]
macro_rules! default_env {
    ($name:expr, $default:expr $(,)?) => {
        match option_env!($name) {
            Some(v) => v,
            None => $default,
        }
    };
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::option_env_bool;

    // Env-mutating tests share process state; each uses its own variable name.

    #[test_log::test]
    fn option_env_bool_parses_truthy_tokens() {
        for token in ["1", "true", "YES", "On"] {
            std::env::set_var("TRELLIS_TEST_BOOL_TRUTHY", token);
            let result = option_env_bool("TRELLIS_TEST_BOOL_TRUTHY").unwrap();
            assert_eq!(result, Some(true));
        }
        std::env::remove_var("TRELLIS_TEST_BOOL_TRUTHY");
    }

    #[test_log::test]
    fn option_env_bool_parses_falsy_tokens() {
        for token in ["0", "false", "NO", "off"] {
            std::env::set_var("TRELLIS_TEST_BOOL_FALSY", token);
            let result = option_env_bool("TRELLIS_TEST_BOOL_FALSY").unwrap();
            assert_eq!(result, Some(false));
        }
        std::env::remove_var("TRELLIS_TEST_BOOL_FALSY");
    }

    #[test_log::test]
    fn option_env_bool_rejects_invalid_token() {
        std::env::set_var("TRELLIS_TEST_BOOL_INVALID", "maybe");
        let result = option_env_bool("TRELLIS_TEST_BOOL_INVALID");
        assert!(result.is_err());
        std::env::remove_var("TRELLIS_TEST_BOOL_INVALID");
    }

    #[test_log::test]
    fn option_env_bool_missing_is_none() {
        let result = option_env_bool("TRELLIS_TEST_BOOL_MISSING").unwrap();
        assert_eq!(result, None);
    }
}
