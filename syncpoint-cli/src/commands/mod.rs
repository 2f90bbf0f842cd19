//! CLI command implementations.

pub mod check;
pub mod demo;

use anyhow::{Context, Result};
use std::path::Path;
use syncpoint_client::ClientConfig;

/// Load the configuration file if one was given, defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
