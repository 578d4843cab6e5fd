//! coffeeshop-intake: order intake API
//!
//! Accepts orders over HTTP/JSON (`POST /v1/api/orders`), splits them into
//! line items and publishes `barista-order-placed` / `kitchen-order-placed`
//! events. Mounted behind the gateway.
//!
//! ## Configuration
//! - AMQP_URL / RABBITMQ_URL: broker URL
//! - COFFEESHOP__INTAKE__PORT: listener port (default: 5002)
//! - COFFEESHOP_LOG: log filter (default: info)

use std::process::ExitCode;

use tracing::error;

use coffeeshop::process::Shutdown;
use coffeeshop::services::{broker_for, exit_code, run_intake};
use coffeeshop::telemetry::{shutdown_within, SHUTDOWN_TIMEOUT};
use coffeeshop::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> ExitCode {
    let app = match bootstrap("intake") {
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

    let reason = run_intake(&app.config, broker, app.telemetry, Shutdown::new()).await;
    exit_code(&reason)
}
