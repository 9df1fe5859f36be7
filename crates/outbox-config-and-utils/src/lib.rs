//! Configuration, paths and logging for the outbox daemon.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_ENDPOINT, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, CentralLogWriter};
pub use paths::Paths;
