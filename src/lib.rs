//! Coffeeshop - event-driven storefront services
//!
//! Order intake, barista, kitchen and counter services exchange events
//! over a shared broker; a gateway exposes backend services as one
//! HTTP/JSON front door.

pub mod bus;
pub mod config;
pub mod gateway;
#[cfg(feature = "postgres")]
pub mod migrate;
pub mod process;
pub mod services;
pub mod telemetry;
pub mod utils;
