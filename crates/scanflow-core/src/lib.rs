/*!
 * Scanflow Core
 *
 * This crate provides the core functionality for the scanflow network
 * scanner backend: the event loop, configuration, error handling and
 * logging, plus the scalar types shared across the workspace.
 */

#![warn(missing_docs)]

pub mod config;
pub mod eloop;
pub mod error;
pub mod logging;
pub mod types;

/// Scanflow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Scanflow Core {} initialized", VERSION);
    Ok(())
}
