//! coffeeshop-kitchen: prepares food
//!
//! Consumes `kitchen-order-placed` events from `kitchen-order-queue`,
//! simulates preparation and publishes `kitchen-order-updated` to the
//! counter.
//!
//! ## Configuration
//! - AMQP_URL / RABBITMQ_URL: broker URL
//! - METRICS_PORT: Prometheus endpoint port (default: 9464)
//! - OTEL_EXPORTER_OTLP_ENDPOINT: trace collector
//! - COFFEESHOP_LOG: log filter (default: info)

use std::process::ExitCode;

use tracing::error;

use coffeeshop::process::Shutdown;
use coffeeshop::services::{
    broker_for, exit_code, run_service, topology, KitchenWorker, ServiceSpec,
};
use coffeeshop::telemetry::{shutdown_within, SHUTDOWN_TIMEOUT};
use coffeeshop::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> ExitCode {
    let app = match bootstrap("kitchen") {
        Ok(app) => app,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let broker = match broker_for(&app.config.messaging, &app.name) {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "Failed to build broker transport");
            if let Some(telemetry) = app.telemetry {
                shutdown_within(telemetry, SHUTDOWN_TIMEOUT).await;
            }
            return ExitCode::FAILURE;
        }
    };

    let spec = ServiceSpec::new(
        app.name.clone(),
        topology::kitchen_orders(),
        KitchenWorker::new(app.name.clone()),
    )
    .forwarding_to(topology::kitchen_updates());

    let reason = run_service(spec, &app.config, broker, app.telemetry, Shutdown::new()).await;
    exit_code(&reason)
}
