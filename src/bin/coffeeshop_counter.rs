//! coffeeshop-counter: announces finished items
//!
//! Consumes `barista-order-updated` and `kitchen-order-updated` events from
//! `counter-order-queue`. Terminal stage: publishes nothing.

use std::process::ExitCode;

use tracing::error;

use coffeeshop::process::Shutdown;
use coffeeshop::services::{
    broker_for, exit_code, run_service, topology, CounterWorker, ServiceSpec,
};
use coffeeshop::telemetry::{shutdown_within, SHUTDOWN_TIMEOUT};
use coffeeshop::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> ExitCode {
    let app = match bootstrap("counter") {
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
        topology::counter_updates(),
        CounterWorker::new(),
    );

    let reason = run_service(spec, &app.config, broker, app.telemetry, Shutdown::new()).await;
    exit_code(&reason)
}
