//! Library crate for opswatch-rs: a cancellable task engine for port scans and
//! host monitors, with a job registry, alert fan-out and result sinks.
pub mod config;
pub mod engine;
pub mod error;
mod monitor;
pub mod ports;
pub mod registry;
pub mod sampler;
mod scan;
pub mod server;
pub mod sink;
pub mod thresholds;
pub mod types;

pub use engine::Engine;
pub use error::{EngineError, SinkError};
