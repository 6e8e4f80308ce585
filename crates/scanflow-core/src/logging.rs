/*!
 * Logging functionality for scanflow.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the scanner backend.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "scanflow=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a device
///
/// All log records emitted while driving a device carry its name, so
/// interleaved output from several devices stays attributable.
pub fn device_span(name: &str) -> Span {
    tracing::info_span!("device", name = %name)
}
