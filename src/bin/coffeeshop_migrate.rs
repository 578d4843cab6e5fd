//! coffeeshop-migrate: applies database migrations
//!
//! Reads migrations from `/db/migrations` when `IN_DOCKER` is true and from
//! `db/migrations` otherwise, and applies whatever is pending.
//!
//! ## Configuration
//! - DATABASE_URL / PG_URL: Postgres URL (`sslmode=disable` is added)
//! - IN_DOCKER: running inside the container image
//!
//! Exits with status 2 on any failure.

use std::process::ExitCode;

use tracing::error;

use coffeeshop::migrate::run_migrations;
use coffeeshop::telemetry::{shutdown_within, SHUTDOWN_TIMEOUT};
use coffeeshop::utils::bootstrap::bootstrap;

const FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let app = match bootstrap("migrate") {
        Ok(app) => app,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return ExitCode::from(FAILURE);
        }
    };
    let database = &app.config.database;

    let result = run_migrations(
        &database.connection_url(),
        &database.migrations_dir(),
        &database.connect,
    )
    .await;

    if let Some(telemetry) = app.telemetry {
        shutdown_within(telemetry, SHUTDOWN_TIMEOUT).await;
    }

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Migrate failed");
            ExitCode::from(FAILURE)
        }
    }
}
