//! Service lifecycles.
//!
//! One consumer service runs three tasks off a shared `Shutdown` token: the
//! signal listener, the metrics server and the consumer loop. When the
//! token fires, deliveries stop, in-flight work drains, the broker link
//! closes and telemetry is flushed, in that order.
//!
//! The intake service follows the same order with its HTTP listener in
//! place of the consumer loop.

use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use tracing::{error, info, warn};

use crate::bus::{
    Broker, BusError, ConnectionManager, Consumer, ConsumerConfig, MemoryBroker, Publisher,
    PublisherConfig, Worker,
};
use crate::config::{BrokerType, Config, MessagingConfig};
use crate::process::{listen_for_signals, Shutdown, ShutdownReason};
use crate::telemetry::{serve_metrics, shutdown_within, BusMetrics, Telemetry, SHUTDOWN_TIMEOUT};

use super::intake::{self, OrderIntake};

/// What a consumer service subscribes to and where its output goes.
pub struct ServiceSpec<W: Worker> {
    pub name: String,
    pub subscription: ConsumerConfig,
    pub forward: Option<PublisherConfig>,
    pub worker: Arc<W>,
}

impl<W: Worker> ServiceSpec<W> {
    pub fn new(name: impl Into<String>, subscription: ConsumerConfig, worker: W) -> Self {
        Self {
            name: name.into(),
            subscription,
            forward: None,
            worker: Arc::new(worker),
        }
    }

    pub fn forwarding_to(mut self, forward: PublisherConfig) -> Self {
        self.forward = Some(forward);
        self
    }
}

/// Build the broker transport selected by `messaging.type`.
pub fn broker_for(messaging: &MessagingConfig, name: &str) -> Result<Arc<dyn Broker>, BusError> {
    match messaging.broker_type {
        #[cfg(feature = "amqp")]
        BrokerType::Amqp => Ok(Arc::new(crate::bus::AmqpBroker::new(
            messaging.url.clone(),
            name,
        ))),
        #[cfg(not(feature = "amqp"))]
        BrokerType::Amqp => {
            let _ = name;
            Err(BusError::InvalidConfig(
                "AMQP transport not compiled in (enable the `amqp` feature)".to_string(),
            ))
        }
        BrokerType::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}

/// Run a consumer service until shutdown.
///
/// Returns why the service stopped. Start-up failures (broker unreachable,
/// topology rejected) are raised on the token as fatal and still go
/// through the regular cleanup.
pub async fn run_service<W: Worker>(
    spec: ServiceSpec<W>,
    config: &Config,
    broker: Arc<dyn Broker>,
    telemetry: Option<Telemetry>,
    shutdown: Shutdown,
) -> ShutdownReason {
    let signals = tokio::spawn(listen_for_signals(shutdown.clone()));

    let metrics_server = telemetry.as_ref().map(|t| {
        let router = t.metrics_router();
        let port = config.metrics.port;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(port, router, shutdown).await {
                warn!(port, error = %e, "Metrics server failed");
            }
        })
    });

    let manager = ConnectionManager::new(broker, config.messaging.retry.clone(), shutdown.clone());
    let bus_metrics = telemetry.as_ref().map(Telemetry::bus_metrics);

    // A signal during the initial dial abandons start-up.
    let consumer_task = tokio::select! {
        biased;
        started = start(&spec, config, &manager, bus_metrics, &shutdown) => match started {
            Ok(task) => Some(task),
            Err(e) => {
                error!(service = %spec.name, error = %e, "Service failed to start");
                shutdown.fatal(format!("{}: {}", spec.name, e));
                None
            }
        },
        _ = shutdown.cancelled() => None,
    };

    shutdown.cancelled().await;
    let reason = shutdown.reason().unwrap_or(ShutdownReason::Requested);
    info!(service = %spec.name, reason = %reason, "Shutting down");

    // The consumer bounds its own drain by its shutdown grace.
    if let Some(task) = consumer_task {
        if let Err(e) = task.await {
            error!(service = %spec.name, error = %e, "Consumer task panicked");
        }
    }
    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    if let Err(e) = manager.close().await {
        warn!(service = %spec.name, error = %e, "Failed to close broker link");
    }
    if let Some(telemetry) = telemetry {
        shutdown_within(telemetry, SHUTDOWN_TIMEOUT).await;
    }
    signals.abort();

    info!(service = %spec.name, "Service stopped");
    reason
}

async fn start<W: Worker>(
    spec: &ServiceSpec<W>,
    config: &Config,
    manager: &ConnectionManager,
    metrics: Option<BusMetrics>,
    shutdown: &Shutdown,
) -> Result<tokio::task::JoinHandle<()>, BusError> {
    manager.connect().await?;

    let forward = match &spec.forward {
        Some(publisher_config) => {
            let mut publisher = Publisher::new(manager.clone(), publisher_config.clone())?;
            if let Some(metrics) = &metrics {
                publisher = publisher.with_metrics(metrics.clone());
            }
            publisher.configure().await?;
            Some(Arc::new(publisher))
        }
        None => None,
    };

    let mut consumer = Consumer::new(
        manager.clone(),
        config.messaging.tune(spec.subscription.clone()),
    )?;
    if let Some(metrics) = metrics {
        consumer = consumer.with_metrics(metrics);
    }
    consumer.configure().await?;

    let worker = spec.worker.clone();
    let name = spec.name.clone();
    let shutdown = shutdown.clone();
    Ok(tokio::spawn(async move {
        if let Err(e) = consumer
            .start_consumer(worker, forward, shutdown.clone())
            .await
        {
            error!(service = %name, error = %e, "Consumer failed");
            shutdown.fatal(format!("{}: consumer failed: {}", name, e));
        }
    }))
}

/// Run the order intake API until shutdown.
///
/// Serves `intake::router` and `/metrics` on `intake.host:intake.port`.
/// Orders arriving while the broker link is down get 503; the link is
/// re-dialed in the background.
pub async fn run_intake(
    config: &Config,
    broker: Arc<dyn Broker>,
    telemetry: Option<Telemetry>,
    shutdown: Shutdown,
) -> ShutdownReason {
    let signals = tokio::spawn(listen_for_signals(shutdown.clone()));
    let manager = ConnectionManager::new(broker, config.messaging.retry.clone(), shutdown.clone());
    let metrics_router = telemetry
        .as_ref()
        .map(Telemetry::metrics_router)
        .unwrap_or_else(Router::new);
    let bus_metrics = telemetry.as_ref().map(Telemetry::bus_metrics);

    let server = tokio::select! {
        biased;
        started = start_intake(config, &manager, bus_metrics, metrics_router, &shutdown) => {
            match started {
                Ok(task) => Some(task),
                Err(e) => {
                    error!(error = %e, "Intake failed to start");
                    shutdown.fatal(format!("intake: {}", e));
                    None
                }
            }
        }
        _ = shutdown.cancelled() => None,
    };

    shutdown.cancelled().await;
    let reason = shutdown.reason().unwrap_or(ShutdownReason::Requested);
    info!(reason = %reason, "Shutting down intake");

    if let Some(server) = server {
        let _ = server.await;
    }
    if let Err(e) = manager.close().await {
        warn!(error = %e, "Failed to close broker link");
    }
    if let Some(telemetry) = telemetry {
        shutdown_within(telemetry, SHUTDOWN_TIMEOUT).await;
    }
    signals.abort();

    info!("Intake stopped");
    reason
}

#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

async fn start_intake(
    config: &Config,
    manager: &ConnectionManager,
    metrics: Option<BusMetrics>,
    metrics_router: Router,
    shutdown: &Shutdown,
) -> Result<tokio::task::JoinHandle<()>, StartError> {
    manager.connect().await?;

    let mut orders = OrderIntake::new(manager.clone())?;
    if let Some(metrics) = metrics {
        orders = orders.with_metrics(metrics);
    }
    orders.configure().await?;

    let addr = format!("{}:{}", config.intake.host, config.intake.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(address = %addr, "Intake API listening");

    let app = intake::router(Arc::new(orders)).merge(metrics_router);
    let shutdown = shutdown.clone();
    Ok(tokio::spawn(async move {
        let cancelled = shutdown.clone();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancelled.cancelled().await })
            .await
        {
            error!(error = %e, "Intake API failed");
            shutdown.fatal(format!("intake: {}", e));
        }
    }))
}

/// Process exit status for a shutdown reason.
pub fn exit_code(reason: &ShutdownReason) -> ExitCode {
    if reason.is_fatal() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
