pub mod config;
pub mod monitor;

pub use config::Config;
pub use monitor::{HealthMonitor, HealthReport};
