/*!
 * actorlink Core
 *
 * This crate provides the building blocks shared by the actorlink device
 * layer: error types, synchronous observers, configuration, and logging.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod observable;
pub mod prelude;
pub mod types;
pub mod utils;

/// actorlink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("actorlink core {} initialized", VERSION);
    Ok(())
}

/// Library initialization with the logging filter from `config`
pub fn init_with_config(config: &config::Config) -> Result<(), error::Error> {
    logging::init_with_filter(&config.logging.level)?;
    tracing::info!(devices = config.devices.len(), "actorlink core {} initialized", VERSION);
    Ok(())
}
