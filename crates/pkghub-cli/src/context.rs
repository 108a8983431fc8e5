//! Configuration and hub construction shared by all commands.

use anyhow::{Context, Result};
use pkghub_core::PackageHub;
use pkghub_core::config::{HubConfig, StorageBackend};
use pkghub_core::paths::config_path;
use pkghub_core::store;

use crate::Cli;

/// Load the config file, then apply environment and command-line overrides.
pub fn load_config(cli: &Cli) -> Result<HubConfig> {
    let path = cli.config.clone().unwrap_or_else(config_path);
    let mut config = HubConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env()?;

    if let Some(root) = &cli.storage {
        config.storage.backend = StorageBackend::Fs;
        config.storage.root.clone_from(root);
    }
    config.validate()?;
    tracing::debug!(backend = ?config.storage.backend, "configuration loaded");
    Ok(config)
}

/// Open the configured store and wire a hub over it.
pub async fn open_hub(cli: &Cli) -> Result<PackageHub> {
    let config = load_config(cli)?;
    let store = store::open(&config.storage).context("Failed to open package storage")?;
    PackageHub::new(config, store).await
}
