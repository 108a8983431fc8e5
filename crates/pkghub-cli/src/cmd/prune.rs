//! Prune-versions command

use anyhow::{Context, Result};
use pkghub_core::PackageHub;

/// Apply the lifecycle policy to non-current object versions
pub async fn prune_versions(hub: &PackageHub) -> Result<()> {
    let lifecycle = &hub.config().lifecycle;
    let removed = hub
        .prune_versions()
        .await
        .context("Failed to expire non-current versions")?;
    println!(
        "  Removed {removed} non-current version(s) (retention: {} days, catalog: {} days)",
        lifecycle.noncurrent_days, lifecycle.catalog_noncurrent_days
    );
    Ok(())
}
