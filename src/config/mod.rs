//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files and environment variables.

mod messaging;
mod server;
mod storage;

pub use messaging::{BrokerType, MessagingConfig};
pub use server::{
    BackendEndpoint, GatewayConfig, IntakeConfig, LogConfig, LogFormat, MetricsConfig, ServiceConfig,
};
pub use storage::{DatabaseConfig, DOCKER_MIGRATIONS_DIR, LOCAL_MIGRATIONS_DIR};

use serde::Deserialize;

use crate::telemetry::TelemetryConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COFFEESHOP_CONFIG";
/// Prefix for structured configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COFFEESHOP";
/// Environment variable for the log filter.
pub const LOG_ENV_VAR: &str = "COFFEESHOP_LOG";

/// Environment variable for the service name.
pub const APP_NAME_ENV_VAR: &str = "APP_NAME";
/// Environment variable for the service version.
pub const APP_VERSION_ENV_VAR: &str = "APP_VERSION";
/// Environment variable for the broker URL.
pub const AMQP_URL_ENV_VAR: &str = "AMQP_URL";
/// Alternative environment variable for the broker URL.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";
/// Environment variable for the database URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";
/// Alternative environment variable for the database URL.
pub const PG_URL_ENV_VAR: &str = "PG_URL";
/// Environment variable for the metrics port.
pub const METRICS_PORT_ENV_VAR: &str = "METRICS_PORT";
/// Environment variable for the OTLP collector endpoint.
pub const OTLP_ENDPOINT_ENV_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Environment variable for a plaintext collector connection.
pub const OTLP_INSECURE_ENV_VAR: &str = "OTEL_EXPORTER_OTLP_INSECURE";
/// Environment variable set when running inside the container image.
pub const IN_DOCKER_ENV_VAR: &str = "IN_DOCKER";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub log: LogConfig,
    pub messaging: MessagingConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub telemetry: TelemetryConfig,
    pub gateway: GatewayConfig,
    pub intake: IntakeConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix (`__` separated)
    /// 5. Well-known deployment variables (`AMQP_URL`, `METRICS_PORT`, ...)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply the well-known deployment variables on top of file config.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(name) = get(APP_NAME_ENV_VAR) {
            self.service.name = Some(name);
        }
        if let Some(version) = get(APP_VERSION_ENV_VAR) {
            self.service.version = version;
        }
        if let Some(url) = get(AMQP_URL_ENV_VAR).or_else(|| get(RABBITMQ_URL_ENV_VAR)) {
            self.messaging.url = url;
        }
        if let Some(url) = get(DATABASE_URL_ENV_VAR).or_else(|| get(PG_URL_ENV_VAR)) {
            self.database.url = url;
        }
        if let Some(port) = get(METRICS_PORT_ENV_VAR) {
            self.metrics.port = port.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidEnv {
                    var: METRICS_PORT_ENV_VAR,
                    value: port.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(endpoint) = get(OTLP_ENDPOINT_ENV_VAR) {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
        if let Some(value) = get(OTLP_INSECURE_ENV_VAR) {
            self.telemetry.insecure = parse_bool(OTLP_INSECURE_ENV_VAR, &value)?;
        }
        if let Some(value) = get(IN_DOCKER_ENV_VAR) {
            self.database.in_docker = parse_bool(IN_DOCKER_ENV_VAR, &value)?;
        }
        Ok(())
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
