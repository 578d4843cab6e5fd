//! HTTP/JSON gateway.
//!
//! Mounts backends under path prefixes and exposes them as one HTTP front
//! door. Requests are dispatched to the backend with the longest matching
//! prefix and forwarded with their original path.

mod backend;
mod cors;

pub use backend::{strip_hop_by_hop, Backend, HttpBackend, MAX_BODY_BYTES};
pub use cors::{allow_cors, log_requests, PREFLIGHT_METHODS};

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{middleware, Json, Router};
use serde_json::json;
use tracing::{error, info, warn};

use crate::bus::RetryPolicy;
use crate::config::{BackendEndpoint, GatewayConfig};
use crate::process::{listen_for_signals, Shutdown, ShutdownReason};
use crate::telemetry::{shutdown_within, Telemetry, SHUTDOWN_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("backend '{name}' has an invalid endpoint: {reason}")]
    InvalidEndpoint { name: String, reason: String },

    #[error("failed to dial backend '{name}': {message}")]
    Dial { name: String, message: String },

    #[error("a backend is already mounted at '{0}'")]
    DuplicatePrefix(String),

    #[error("backend '{name}' failed: {message}")]
    Upstream { name: String, message: String },

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("gateway server error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Body(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
struct Mount {
    prefix: String,
    backend: Arc<dyn Backend>,
}

impl Mount {
    fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        path == self.prefix
            || path
                .strip_prefix(self.prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Backends keyed by path prefix.
#[derive(Clone, Default)]
pub struct Gateway {
    mounts: Vec<Mount>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial `endpoint` per `policy` and mount it. Any failure should abort
    /// startup.
    pub async fn register(
        &mut self,
        endpoint: &BackendEndpoint,
        policy: &RetryPolicy,
    ) -> Result<(), GatewayError> {
        let backend = HttpBackend::dial(endpoint, policy).await?;
        self.register_backend(&endpoint.prefix, Arc::new(backend))
    }

    /// Mount an already built backend under `prefix`.
    pub fn register_backend(
        &mut self,
        prefix: &str,
        backend: Arc<dyn Backend>,
    ) -> Result<(), GatewayError> {
        let prefix = normalize_prefix(prefix);
        if self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(GatewayError::DuplicatePrefix(prefix));
        }
        info!(backend = backend.name(), prefix = %prefix, "Mounted backend");
        self.mounts.push(Mount { prefix, backend });
        // Longest prefix first so the first match wins.
        self.mounts
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(())
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.prefix.as_str()).collect()
    }

    /// The composed handler with CORS and request logging applied.
    pub fn router(self) -> Router {
        self.router_with(Router::new())
    }

    /// Like `router`, with `extra` routes (e.g. `/metrics`) taking
    /// precedence over backend dispatch.
    pub fn router_with(self, extra: Router) -> Router {
        let mounts: Arc<Vec<Mount>> = Arc::new(self.mounts);
        Router::new()
            .fallback(dispatch)
            .with_state(mounts)
            .merge(extra)
            .layer(middleware::from_fn(log_requests))
            .layer(middleware::from_fn(allow_cors))
    }
}

async fn dispatch(State(mounts): State<Arc<Vec<Mount>>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(mount) = mounts.iter().find(|m| m.matches(&path)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no backend for path", "path": path })),
        )
            .into_response();
    };

    match mount.backend.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(backend = mount.backend.name(), %path, error = %e, "Backend request failed");
            e.into_response()
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Serve `router` on `host:port` until `shutdown` fires.
pub async fn serve(
    router: Router,
    host: &str,
    port: u16,
    shutdown: Shutdown,
) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual = listener.local_addr()?;
    info!(address = %actual, "Gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Run the gateway until shutdown.
///
/// Every configured backend must dial, otherwise the run ends as fatal.
/// Telemetry is flushed on every exit path.
pub async fn run_gateway(
    settings: &GatewayConfig,
    telemetry: Option<Telemetry>,
    shutdown: Shutdown,
) -> ShutdownReason {
    let signals = tokio::spawn(listen_for_signals(shutdown.clone()));

    let mounted = tokio::select! {
        biased;
        mounted = mount_all(settings) => Some(mounted),
        _ = shutdown.cancelled() => None,
    };
    match mounted {
        Some(Ok(gateway)) => {
            let metrics = telemetry
                .as_ref()
                .map(Telemetry::metrics_router)
                .unwrap_or_else(Router::new);
            let router = gateway.router_with(metrics);
            if let Err(e) = serve(router, &settings.host, settings.port, shutdown.clone()).await {
                error!(error = %e, "Gateway server failed");
                shutdown.fatal(e.to_string());
            }
        }
        Some(Err(e)) => {
            error!(error = %e, "Failed to register backend");
            shutdown.fatal(e.to_string());
        }
        None => {}
    }

    let reason = shutdown.reason().unwrap_or(ShutdownReason::Requested);
    if let Some(telemetry) = telemetry {
        shutdown_within(telemetry, SHUTDOWN_TIMEOUT).await;
    }
    signals.abort();
    info!(reason = %reason, "Gateway stopped");
    reason
}

async fn mount_all(settings: &GatewayConfig) -> Result<Gateway, GatewayError> {
    let mut gateway = Gateway::new();
    for endpoint in &settings.backends {
        gateway.register(endpoint, &settings.dial).await?;
    }
    if settings.backends.is_empty() {
        info!("No backends configured, every request will get 404");
    }
    Ok(gateway)
}
