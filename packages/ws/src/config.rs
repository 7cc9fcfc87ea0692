//! Layered runtime configuration.
//!
//! Built-in defaults are overlaid by framework-provided file config, then
//! by environment variables (highest precedence). Merging is pure and
//! deep; neither input is mutated. Per-route overrides shadow the global
//! connection limit, timeout, compression and rate-limit values.
//! Validation reports human-readable problems without aborting startup.

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    breaker::BreakerConfig,
    rate_limiter::RateLimitRule,
    router::pattern_matches,
};

pub const ENV_ENABLED: &str = "TRELLIS_WS_ENABLED";
pub const ENV_MAX_CONNECTIONS: &str = "TRELLIS_WS_MAX_CONNECTIONS";
pub const ENV_TIMEOUT: &str = "TRELLIS_WS_TIMEOUT";
pub const ENV_COMPRESSION: &str = "TRELLIS_WS_COMPRESSION";
pub const ENV_MAX_PAYLOAD_SIZE: &str = "TRELLIS_WS_MAX_PAYLOAD_SIZE";
pub const ENV_METRICS: &str = "TRELLIS_WS_METRICS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    /// Allowed origins; `None` accepts any origin.
    pub origins: Option<Vec<String>>,
    /// Maximum inbound payload size in bytes.
    pub max_payload_size: usize,
    pub validate_protocol: bool,
    pub allowed_protocols: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            origins: None,
            max_payload_size: 1024 * 1024,
            validate_protocol: false,
            allowed_protocols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub initial_delay: u64,
    pub interval: u64,
    pub probes: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: 30_000,
            interval: 10_000,
            probes: 3,
        }
    }
}

/// Either a plain toggle or tuned deflate parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeflateSetting {
    Enabled(bool),
    Tuned {
        threshold: usize,
        #[serde(rename = "serverMaxWindowBits")]
        server_max_window_bits: u8,
        #[serde(rename = "serverMaxNoContextTakeover")]
        server_max_no_context_takeover: bool,
    },
}

impl Default for DeflateSetting {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub per_message_deflate: DeflateSetting,
    pub backlog: Option<u32>,
    pub keep_alive: KeepAliveConfig,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            per_message_deflate: DeflateSetting::default(),
            backlog: None,
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub path: String,
    pub interval: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/api/websocket/health".to_string(),
            interval: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    pub metrics: bool,
    pub detailed_logging: bool,
    pub health_check: HealthCheckConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            detailed_logging: false,
            health_check: HealthCheckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_requests: usize,
}

impl From<RateLimitSettings> for RateLimitRule {
    fn from(settings: RateLimitSettings) -> Self {
        Self {
            window: Duration::from_millis(settings.window_ms),
            max_requests: settings.max_requests,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteOverrides {
    pub max_connections: Option<usize>,
    pub timeout: Option<u64>,
    pub compression: Option<bool>,
    pub rate_limit: Option<RateLimitSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: u64,
    pub monitoring_window: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: 60_000,
            monitoring_window: 300_000,
            success_threshold: 3,
        }
    }
}

impl From<CircuitBreakerSettings> for BreakerConfig {
    fn from(settings: CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout),
            monitoring_window: Duration::from_millis(settings.monitoring_window),
            success_threshold: settings.success_threshold,
        }
    }
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsConfig {
    pub enabled: bool,
    pub max_connections: usize,
    /// Connection timeout in milliseconds; doubles as the idle-connection
    /// timeout.
    pub timeout: u64,
    pub compression: bool,
    /// Squelch a second upgrade from the same (URL, client) within the
    /// duplicate window. Off by default: it would cap rate-limit rules at
    /// one upgrade per second per client.
    pub dedupe_rapid_upgrades: bool,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
    pub routes: BTreeMap<String, RouteOverrides>,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 1000,
            timeout: 30_000,
            compression: true,
            dedupe_rapid_upgrades: false,
            security: SecurityConfig::default(),
            performance: PerformanceConfig::default(),
            monitoring: MonitoringConfig::default(),
            routes: BTreeMap::new(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

/// Partial configuration used for file and environment layers. Every
/// field is optional; absent fields keep the lower layer's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsConfigOverlay {
    pub enabled: Option<bool>,
    pub max_connections: Option<usize>,
    pub timeout: Option<u64>,
    pub compression: Option<bool>,
    pub dedupe_rapid_upgrades: Option<bool>,
    pub security: Option<SecurityOverlay>,
    pub performance: Option<PerformanceOverlay>,
    pub monitoring: Option<MonitoringOverlay>,
    pub routes: Option<BTreeMap<String, RouteOverrides>>,
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityOverlay {
    pub origins: Option<Vec<String>>,
    pub max_payload_size: Option<usize>,
    pub validate_protocol: Option<bool>,
    pub allowed_protocols: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceOverlay {
    pub per_message_deflate: Option<DeflateSetting>,
    pub backlog: Option<u32>,
    pub keep_alive: Option<KeepAliveConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringOverlay {
    pub metrics: Option<bool>,
    pub detailed_logging: Option<bool>,
    pub health_check: Option<HealthCheckConfig>,
}

/// Per-route effective view after overrides shadow the globals.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveRouteConfig {
    pub max_connections: usize,
    pub timeout: Duration,
    pub compression: bool,
    pub rate_limit: Option<RateLimitRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

impl WsConfig {
    /// Applies an overlay, returning a new config. Neither input is
    /// mutated; nested sections merge field-wise.
    #[must_use]
    pub fn merge(&self, overlay: &WsConfigOverlay) -> Self {
        let mut merged = self.clone();

        if let Some(enabled) = overlay.enabled {
            merged.enabled = enabled;
        }
        if let Some(max_connections) = overlay.max_connections {
            merged.max_connections = max_connections;
        }
        if let Some(timeout) = overlay.timeout {
            merged.timeout = timeout;
        }
        if let Some(compression) = overlay.compression {
            merged.compression = compression;
        }
        if let Some(dedupe) = overlay.dedupe_rapid_upgrades {
            merged.dedupe_rapid_upgrades = dedupe;
        }
        if let Some(security) = &overlay.security {
            if let Some(origins) = &security.origins {
                merged.security.origins = Some(origins.clone());
            }
            if let Some(size) = security.max_payload_size {
                merged.security.max_payload_size = size;
            }
            if let Some(validate) = security.validate_protocol {
                merged.security.validate_protocol = validate;
            }
            if let Some(protocols) = &security.allowed_protocols {
                merged.security.allowed_protocols = protocols.clone();
            }
        }
        if let Some(performance) = &overlay.performance {
            if let Some(deflate) = &performance.per_message_deflate {
                merged.performance.per_message_deflate = deflate.clone();
            }
            if let Some(backlog) = performance.backlog {
                merged.performance.backlog = Some(backlog);
            }
            if let Some(keep_alive) = performance.keep_alive {
                merged.performance.keep_alive = keep_alive;
            }
        }
        if let Some(monitoring) = &overlay.monitoring {
            if let Some(metrics) = monitoring.metrics {
                merged.monitoring.metrics = metrics;
            }
            if let Some(detailed) = monitoring.detailed_logging {
                merged.monitoring.detailed_logging = detailed;
            }
            if let Some(health_check) = &monitoring.health_check {
                merged.monitoring.health_check = health_check.clone();
            }
        }
        if let Some(routes) = &overlay.routes {
            for (pattern, overrides) in routes {
                merged.routes.insert(pattern.clone(), overrides.clone());
            }
        }
        if let Some(circuit_breaker) = overlay.circuit_breaker {
            merged.circuit_breaker = circuit_breaker;
        }

        merged
    }

    /// Reads an overlay from a JSON file.
    ///
    /// # Errors
    ///
    /// * If the file cannot be read or parsed
    pub fn overlay_from_file(path: &Path) -> Result<WsConfigOverlay, ConfigFileError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Builds the environment overlay. Invalid tokens are discarded with a
    /// debug log, per-variable.
    #[must_use]
    pub fn overlay_from_env() -> WsConfigOverlay {
        let mut overlay = WsConfigOverlay::default();

        match trellis_env_utils::option_env_bool(ENV_ENABLED) {
            Ok(value) => overlay.enabled = value,
            Err(err) => log::debug!("discarding {ENV_ENABLED}: {err}"),
        }
        match trellis_env_utils::option_env_usize(ENV_MAX_CONNECTIONS) {
            Ok(value) => overlay.max_connections = value,
            Err(err) => log::debug!("discarding {ENV_MAX_CONNECTIONS}: {err}"),
        }
        match trellis_env_utils::option_env_u64(ENV_TIMEOUT) {
            Ok(value) => overlay.timeout = value,
            Err(err) => log::debug!("discarding {ENV_TIMEOUT}: {err}"),
        }
        match trellis_env_utils::option_env_bool(ENV_COMPRESSION) {
            Ok(value) => overlay.compression = value,
            Err(err) => log::debug!("discarding {ENV_COMPRESSION}: {err}"),
        }
        match trellis_env_utils::option_env_usize(ENV_MAX_PAYLOAD_SIZE) {
            Ok(Some(size)) => {
                overlay.security = Some(SecurityOverlay {
                    max_payload_size: Some(size),
                    ..SecurityOverlay::default()
                });
            }
            Ok(None) => {}
            Err(err) => log::debug!("discarding {ENV_MAX_PAYLOAD_SIZE}: {err}"),
        }
        match trellis_env_utils::option_env_bool(ENV_METRICS) {
            Ok(Some(metrics)) => {
                overlay.monitoring = Some(MonitoringOverlay {
                    metrics: Some(metrics),
                    ..MonitoringOverlay::default()
                });
            }
            Ok(None) => {}
            Err(err) => log::debug!("discarding {ENV_METRICS}: {err}"),
        }

        overlay
    }

    /// Defaults ⊕ optional file ⊕ environment.
    #[must_use]
    pub fn load(file: Option<&Path>) -> Self {
        let mut config = Self::default();

        if let Some(path) = file {
            match Self::overlay_from_file(path) {
                Ok(overlay) => config = config.merge(&overlay),
                Err(err) => log::warn!("failed to load config from {}: {err}", path.display()),
            }
        }

        let config = config.merge(&Self::overlay_from_env());

        let problems = config.validate();
        if !problems.is_empty() {
            log::warn!("websocket config validation: {}", problems.join("; "));
        }
        config
    }

    /// Human-readable validation problems. A non-empty result is logged by
    /// callers but never aborts startup.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.max_connections == 0 {
            problems.push("maxConnections must be greater than 0".to_string());
        }
        if self.timeout < 1000 {
            problems.push("timeout must be at least 1000 ms".to_string());
        }
        if self.security.max_payload_size == 0 {
            problems.push("security.maxPayloadSize must be greater than 0".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuitBreaker.failureThreshold must be greater than 0".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            problems.push("circuitBreaker.successThreshold must be greater than 0".to_string());
        }
        for (pattern, overrides) in &self.routes {
            if let Some(rate_limit) = overrides.rate_limit {
                if rate_limit.window_ms == 0 {
                    problems.push(format!("routes.{pattern}.rateLimit.windowMs must be greater than 0"));
                }
                if rate_limit.max_requests == 0 {
                    problems
                        .push(format!("routes.{pattern}.rateLimit.maxRequests must be greater than 0"));
                }
            }
            if let Some(max) = overrides.max_connections {
                if max == 0 {
                    problems.push(format!("routes.{pattern}.maxConnections must be greater than 0"));
                }
            }
        }

        problems
    }

    /// The effective settings for a request path, with any matching route
    /// override shadowing the globals.
    #[must_use]
    pub fn route_config(&self, path: &str) -> EffectiveRouteConfig {
        let overrides = self
            .routes
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, path))
            .map(|(_, overrides)| overrides);

        EffectiveRouteConfig {
            max_connections: overrides
                .and_then(|o| o.max_connections)
                .unwrap_or(self.max_connections),
            timeout: Duration::from_millis(
                overrides.and_then(|o| o.timeout).unwrap_or(self.timeout),
            ),
            compression: overrides
                .and_then(|o| o.compression)
                .unwrap_or(self.compression),
            rate_limit: overrides.and_then(|o| o.rate_limit).map(Into::into),
        }
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Whether `origin` passes the configured origin list. Absent list
    /// accepts everything; a `*` entry does too.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(allowed) = &self.security.origins else {
            return true;
        };
        let Some(origin) = origin else {
            // No Origin header: non-browser client; the handler's own
            // policy applies.
            return true;
        };
        allowed
            .iter()
            .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(origin))
    }
}
