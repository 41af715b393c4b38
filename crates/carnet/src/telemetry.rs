//! Process-wide logging setup for the binary and long-running workers.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::CarnetError;

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `default_filter`; `log` records are bridged into `tracing`.
pub fn init_logging(default_filter: &str, json: bool) -> Result<(), CarnetError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| CarnetError::Telemetry(format!("invalid filter '{}': {}", default_filter, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().flatten_event(true).with_current_span(true)),
        )
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
    };
    result.map_err(|e| CarnetError::Telemetry(e.to_string()))?;

    tracing_log::LogTracer::init().map_err(|e| CarnetError::Telemetry(e.to_string()))?;

    Ok(())
}
