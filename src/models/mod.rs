//! # Data Models
//!
//! App records owned by the declarative store and the telemetry readings
//! that drive failover. The controller only reads and derives from these.

pub mod app;
pub mod metric;

pub use app::{App, Config, ConfigKind, Deployment, DigitalTwin, Requirements};
pub use metric::Metric;
