//! Service identity, metrics and gateway configuration types.

use serde::Deserialize;

use crate::bus::RetryPolicy;

/// Service identity, reported in logs and telemetry resources.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Overrides the binary's own service name.
    pub name: Option<String>,
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn name_or(&self, fallback: &str) -> String {
        self.name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Log line format on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    #[default]
    Json,
    /// Human-readable lines for local runs.
    Text,
}

/// Logging configuration. The level filter comes from `COFFEESHOP_LOG`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

/// Prometheus pull endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: 9464 }
    }
}

/// HTTP listener of the order intake API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub host: String,
    pub port: u16,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5002,
        }
    }
}

/// A backend mounted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendEndpoint {
    /// Name for logs.
    pub name: String,
    /// Base URL of the backend's HTTP/JSON surface, e.g. `http://product:5001`.
    pub address: String,
    /// Path prefix routed to this backend. `/` makes it the root backend.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "/".to_string()
}

/// Gateway listener and backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub backends: Vec<BackendEndpoint>,
    /// Dial policy for backends at startup.
    pub dial: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            backends: Vec::new(),
            dial: RetryPolicy::new(5, std::time::Duration::from_secs(1)),
        }
    }
}
