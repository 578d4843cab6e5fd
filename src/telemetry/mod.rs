//! Telemetry pipeline: traces over OTLP/gRPC, metrics over a Prometheus
//! pull endpoint, W3C propagation across the bus.
//!
//! `setup` returns an explicit `Telemetry` handle. The only process-wide
//! state it touches is the OTel global propagator and providers, so that
//! `tracing-opentelemetry` and library code can find them.

use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use opentelemetry::metrics::{MeterProvider as _, ObservableGauge};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::process::Shutdown;

pub mod metrics;
pub mod propagation;

pub use metrics::BusMetrics;

/// Collector endpoint used when none is configured.
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Telemetry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP/gRPC collector endpoint.
    pub otlp_endpoint: Option<String>,
    /// Plaintext connection to the collector.
    pub insecure: bool,
    /// Export traces at all.
    pub traces: bool,
    /// `deployment.environment` resource attribute.
    pub environment: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            insecure: true,
            traces: true,
            environment: None,
        }
    }
}

impl TelemetryConfig {
    /// Endpoint with a scheme chosen by the insecure flag when none given.
    pub fn endpoint(&self) -> String {
        let raw = self
            .otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_OTLP_ENDPOINT);
        if raw.contains("://") {
            raw.to_string()
        } else if self.insecure {
            format!("http://{}", raw)
        } else {
            format!("https://{}", raw)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("trace exporter: {0}")]
    Traces(String),

    #[error("metrics exporter: {0}")]
    Metrics(String),

    #[error("telemetry shutdown: {0}")]
    Shutdown(String),
}

/// Live telemetry providers. Shut down exactly once via `shutdown(self)`.
pub struct Telemetry {
    service_name: String,
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    registry: Registry,
    _runtime_gauges: Vec<ObservableGauge<u64>>,
}

/// Install the composite W3C trace-context + baggage propagator.
pub fn install_propagator() {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
}

/// Build providers sharing one resource and register them globally.
pub fn setup(
    service_name: &str,
    service_version: &str,
    config: &TelemetryConfig,
) -> Result<Telemetry, TelemetryError> {
    let resource = build_resource(service_name, service_version, config);
    install_propagator();

    let tracer_provider = if config.traces {
        let endpoint = config.endpoint();
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build()
            .map_err(|e| TelemetryError::Traces(e.to_string()))?;
        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_resource(resource.clone())
            .build();
        global::set_tracer_provider(provider.clone());
        info!(endpoint = %endpoint, "Trace export enabled");
        Some(provider)
    } else {
        None
    };

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(exporter)
        .with_resource(resource)
        .build();
    global::set_meter_provider(meter_provider.clone());

    #[cfg(target_os = "linux")]
    registry
        .register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))
        .map_err(|e| TelemetryError::Metrics(e.to_string()))?;

    let runtime_gauges = register_runtime_gauges(&meter_provider, service_name);

    Ok(Telemetry {
        service_name: service_name.to_string(),
        tracer_provider,
        meter_provider,
        registry,
        _runtime_gauges: runtime_gauges,
    })
}

impl Telemetry {
    /// Tracer for the `tracing-opentelemetry` layer, when traces are on.
    pub fn tracer(&self) -> Option<Tracer> {
        self.tracer_provider
            .as_ref()
            .map(|p| p.tracer(self.service_name.clone()))
    }

    pub fn bus_metrics(&self) -> BusMetrics {
        BusMetrics::new(&self.meter_provider.meter("coffeeshop"))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `GET /metrics` in the Prometheus text format.
    pub fn metrics_router(&self) -> Router {
        metrics_router(self.registry.clone())
    }

    /// Flush and stop metrics first, then traces.
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        let mut failures = Vec::new();
        if let Err(e) = self.meter_provider.shutdown() {
            failures.push(format!("metrics: {}", e));
        }
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                failures.push(format!("traces: {}", e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::Shutdown(failures.join("; ")))
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("service_name", &self.service_name)
            .field("traces", &self.tracer_provider.is_some())
            .finish()
    }
}

pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry)
}

async fn render_metrics(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&registry.gather(), &mut buf) {
        Ok(()) => ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve `router` on `0.0.0.0:port` until `shutdown` fires.
pub async fn serve_metrics(port: u16, router: Router, shutdown: Shutdown) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");
    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn build_resource(service_name: &str, service_version: &str, config: &TelemetryConfig) -> Resource {
    let mut attrs = vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", service_version.to_string()),
        KeyValue::new("process.pid", std::process::id() as i64),
        KeyValue::new("os.type", std::env::consts::OS),
        KeyValue::new("host.arch", std::env::consts::ARCH),
    ];
    if let Some(exe) = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
    {
        attrs.push(KeyValue::new("process.executable.name", exe));
    }
    if let Some(host) = host_name() {
        attrs.push(KeyValue::new("host.name", host));
    }
    if let Some(id) = container_id() {
        attrs.push(KeyValue::new("container.id", id));
    }
    if let Some(env) = &config.environment {
        attrs.push(KeyValue::new("deployment.environment", env.clone()));
    }
    // Explicit attributes override SDK defaults and OTEL_RESOURCE_ATTRIBUTES.
    Resource::default().merge(&Resource::new(attrs))
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Container id from the cgroup file, if this process runs in one.
fn container_id() -> Option<String> {
    let cgroup = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    parse_container_id(&cgroup)
}

fn parse_container_id(cgroup: &str) -> Option<String> {
    cgroup.lines().find_map(|line| {
        let last = line.rsplit('/').next()?;
        let last = last.trim_end_matches(".scope");
        let id = last.rsplit('-').next()?;
        (id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())).then(|| id.to_string())
    })
}

/// Runtime health gauges read from the tokio runtime at collection time.
fn register_runtime_gauges(provider: &SdkMeterProvider, service_name: &str) -> Vec<ObservableGauge<u64>> {
    let meter = provider.meter("coffeeshop.runtime");
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(service = service_name, "No tokio runtime, skipping runtime gauges");
        return Vec::new();
    };

    let workers = handle.clone();
    let alive = handle.clone();
    let queued = handle;
    vec![
        meter
            .u64_observable_gauge("coffeeshop.runtime.workers")
            .with_description("Tokio worker threads")
            .with_callback(move |observer| {
                observer.observe(workers.metrics().num_workers() as u64, &[])
            })
            .build(),
        meter
            .u64_observable_gauge("coffeeshop.runtime.tasks")
            .with_description("Alive tokio tasks")
            .with_callback(move |observer| {
                observer.observe(alive.metrics().num_alive_tasks() as u64, &[])
            })
            .build(),
        meter
            .u64_observable_gauge("coffeeshop.runtime.global_queue_depth")
            .with_description("Tasks waiting in the tokio global queue")
            .with_callback(move |observer| {
                observer.observe(queued.metrics().global_queue_depth() as u64, &[])
            })
            .build(),
    ]
}

/// Grace given to exporters when the process stops.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `Telemetry::shutdown` off the async runtime, bounded by `timeout`.
///
/// Exporter flushes block, so they get their own thread. Failures are
/// logged and never abort the caller.
pub async fn shutdown_within(telemetry: Telemetry, timeout: Duration) {
    let flush = tokio::task::spawn_blocking(move || telemetry.shutdown());
    match tokio::time::timeout(timeout, flush).await {
        Ok(Ok(Ok(()))) => info!("Telemetry flushed"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Telemetry shutdown failed"),
        Ok(Err(e)) => warn!(error = %e, "Telemetry shutdown task panicked"),
        Err(_) => warn!(timeout = ?timeout, "Telemetry shutdown timed out"),
    }
}

#[cfg(test)]
mod tests;
