//! FleetSim engine library crate
//!
//! Re-exports core modules for integration tests and external use.

pub mod api;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod generator;
pub mod log_stream;
pub mod metrics;
pub mod model;
pub mod project;
pub mod simulator;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use engine::{SimulationEngine, SimulationStatus};
pub use error::{Error, Result};
pub use log_stream::{EventType, LogEntry};
pub use metrics::MetricsCollector;
pub use simulator::{DeviceSimulator, SimulatorOptions};
pub use store::{DescriptorStore, InMemoryStore};
