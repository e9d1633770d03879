//! The Pegasus controller (spec §4.4, §5): ties together the config loader,
//! the registry-backed admission/eviction state machine, and the UDP
//! ingress and reconciliation actors that drive it.

pub mod config;
pub mod controller;
pub mod error;
pub mod ingress;
pub mod reconcile;

pub use config::Config;
pub use controller::{Controller, ControllerError, MigrationEvent};
pub use error::PegasusError;
