//! coffeeshop-gateway: HTTP/JSON front door
//!
//! Mounts the configured backends under their path prefixes and serves
//! them as one API, with CORS, request logging and `/metrics`.
//!
//! ## Configuration
//! ```yaml
//! gateway:
//!   host: 0.0.0.0
//!   port: 5000
//!   backends:
//!     - name: intake
//!       address: http://intake:5002
//!       prefix: /v1/api
//! ```
//! Every backend must be reachable at startup, otherwise the gateway exits.

use std::process::ExitCode;

use coffeeshop::gateway::run_gateway;
use coffeeshop::process::Shutdown;
use coffeeshop::services::exit_code;
use coffeeshop::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> ExitCode {
    let app = match bootstrap("gateway") {
        Ok(app) => app,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let reason = run_gateway(&app.config.gateway, app.telemetry, Shutdown::new()).await;
    exit_code(&reason)
}
