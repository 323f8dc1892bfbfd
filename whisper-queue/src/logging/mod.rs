//! Logging initialization.
//!
//! Sets up a `tracing` subscriber with an env-filter. The filter comes from
//! `RUST_LOG` when set, otherwise from [`DEFAULT_LOG_FILTER`].

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "whisper_queue=info,sqlx=warn,tower_http=info";

/// Initialize the global tracing subscriber.
///
/// Returns an error if a subscriber is already installed or the filter
/// directive cannot be parsed.
pub fn init_logging() -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .map_err(|e| crate::Error::Other(format!("Invalid log filter directive: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to install subscriber: {}", e)))?;

    Ok(())
}
