//! Shared start-up helpers.

pub mod bootstrap;
