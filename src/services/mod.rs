//! Storefront services built on the bus.
//!
//! - `intake`: splits orders into station line items
//! - `station`: barista and kitchen workers
//! - `counter`: announces finished items
//! - `runner`: the shared service lifecycles

pub mod counter;
pub mod events;
pub mod intake;
pub mod runner;
pub mod station;
pub mod topology;

pub use counter::CounterWorker;
pub use events::{BaristaOrderPlaced, ItemType, KitchenOrderPlaced, OrderUp, Station};
pub use intake::{IntakeError, MenuItem, OrderAccepted, OrderIntake, PlaceOrder, PlacedItem};
pub use runner::{broker_for, exit_code, run_intake, run_service, ServiceSpec};
pub use station::{BaristaWorker, KitchenWorker, Preparation};
