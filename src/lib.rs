//! Viessmann Bridge Library
//!
//! This library polls a gas boiler's rolling consumption windows, reconciles
//! them into a monotonic lifetime total, and forwards the result together with
//! boiler telemetry to Domoticz and Home Assistant.

pub mod bridge;
pub mod config;
pub mod consumption;
pub mod dispatcher;
pub mod domoticz;
pub mod error;
pub mod home_assistant;
pub mod reconciliation;
pub mod sink;
pub mod vicare;

// Re-export commonly used types for easier access
pub use bridge::{Bridge, CycleReport};
pub use config::Config;
pub use consumption::{ConsumptionSnapshot, Effect, Kwh, Telemetry};
pub use error::BridgeError;
pub use reconciliation::{Outcome, Reconciliation, ReconciliationState};
pub use sink::Sink;
pub use vicare::{SnapshotSource, ViCareClient};
