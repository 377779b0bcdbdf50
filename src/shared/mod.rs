pub mod config;
pub mod logging;

pub use config::{Config, ConfigError, OrchestratorConfig};
pub use logging::{init_logging, LoggingGuard};
