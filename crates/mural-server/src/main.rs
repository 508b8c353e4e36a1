//! # Mural Server
//!
//! Entry point for `murald`, the shared pixel canvas daemon.
//!
//! Usage: `murald [CONFIG]`. Without an argument the configuration is read
//! from `mural.toml` in the working directory. A missing file is created
//! with the defaults.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod app;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ServerConfig, CONFIG_FILE};

/// Main entry point.
fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("mural=info".parse()?))
        .init();

    info!("Mural server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
    let config = ServerConfig::load_from(&config_path);
    if !config_path.exists() {
        // Leave a template the operator can edit.
        if let Err(e) = config.save_to(&config_path) {
            warn!("Failed to write default config: {e}");
        }
    }
    app::run(config)?;

    info!("Mural server shutdown complete");
    Ok(())
}
