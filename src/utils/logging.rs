//! Structured logging setup.
//!
//! `RUST_LOG` takes precedence over the configured level so deployments
//! can raise verbosity without touching config files.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber from a [`LoggingConfig`].
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (config.json_format, config.log_to_console) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().with_writer(std::io::sink).try_init(),
        (false, true) => builder.try_init(),
        (false, false) => builder.with_writer(std::io::sink).try_init(),
    };
    result.map_err(|e| ProtocolError::Config(format!("failed to init logging: {e}")))
}
