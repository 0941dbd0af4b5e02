//! Structured logging configuration.
//!
//! Embedding applications call [`init`] once at startup; the env filter
//! (`RUST_LOG`) overrides the configured level when set.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{CmError, Result};

/// Install the global tracing subscriber from a [`LoggingConfig`].
///
/// # Errors
/// Returns `CmError::Config` if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={}",
            env!("CARGO_CRATE_NAME"),
            config.log_level
        ))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| CmError::Config(format!("Failed to install subscriber: {e}")))
}
