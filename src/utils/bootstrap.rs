//! Bootstrap utilities for coffeeshop binaries.
//!
//! Shared initialization code for all service binaries.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use opentelemetry_sdk::trace::Tracer;
use tracing::{error, info, warn};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::bus::RetryPolicy;
use crate::config::{Config, ConfigError, LogFormat, LOG_ENV_VAR};
use crate::telemetry::{self, Telemetry};

/// What every binary needs before it starts its own work.
pub struct Bootstrap {
    pub config: Config,
    /// Service name after config overrides.
    pub name: String,
    /// `None` when telemetry could not be set up; the service runs without it.
    pub telemetry: Option<Telemetry>,
}

/// Load config, set up telemetry and install the tracing subscriber.
///
/// Telemetry failures are logged and tolerated. Config failures are
/// returned; they are reported on stderr since logging is not up yet.
pub fn bootstrap(default_name: &str) -> Result<Bootstrap, ConfigError> {
    let config = Config::load(None)?;
    let name = config.service.name_or(default_name);

    let telemetry = telemetry::setup(&name, &config.service.version, &config.telemetry);
    let tracer = telemetry.as_ref().ok().and_then(Telemetry::tracer);
    init_tracing(config.log.format, tracer);

    let telemetry = match telemetry {
        Ok(telemetry) => Some(telemetry),
        Err(e) => {
            warn!(error = %e, "Telemetry unavailable, continuing without it");
            None
        }
    };

    info!(name = %name, version = %config.service.version, "Init app");
    Ok(Bootstrap {
        config,
        name,
        telemetry,
    })
}

/// Initialize tracing with the COFFEESHOP_LOG environment variable.
///
/// Defaults to "info" level if COFFEESHOP_LOG is not set. When a tracer is
/// given, spans are also exported through OpenTelemetry.
pub fn init_tracing(format: LogFormat, tracer: Option<Tracer>) {
    let otel = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(log_layer(format, std::io::stdout))
        .with(otel)
        .init();
}

/// The stdout formatting layer for `format`.
pub fn log_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_writer(writer).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    }
}

/// Run `connect` until it succeeds or `policy` is exhausted.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "postgres")
/// * `address` - Where we're connecting, for logging only
/// * `policy` - Attempts and fixed delay between them
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error once attempts run out.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    policy: &RetryPolicy,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = connect
        .retry(policy.backoff())
        .notify(|e: &E, delay: Duration| {
            warn!(
                service = service_name,
                address,
                error = %e,
                delay = ?delay,
                "Connection failed, retrying"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(service = service_name, address, "Connected"),
        Err(e) => error!(
            service = service_name,
            address,
            attempts = policy.max_attempts,
            error = %e,
            "Giving up on connection"
        ),
    }
    result
}
