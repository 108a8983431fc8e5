//! Rebuild command

use anyhow::{Context, Result};
use pkghub_core::{PackageHub, RebuildSummary};

/// Run one catalog rebuild and print what it did
pub async fn rebuild(hub: &PackageHub) -> Result<()> {
    let summary = hub
        .rebuild_and_wait()
        .await
        .context("Catalog rebuild failed; the previous catalog is still served")?;
    print_summary(&summary);
    Ok(())
}

pub(crate) fn print_summary(summary: &RebuildSummary) {
    let lw = 18;
    println!();
    println!("  Catalog rebuilt ({})", summary.built_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  {:<lw$}{}", "listed", summary.listed);
    println!("  {:<lw$}{}", "included", summary.included);
    if summary.excluded_denied > 0 {
        println!("  {:<lw$}{}", "denied", summary.excluded_denied);
    }
    if summary.excluded_license > 0 {
        println!("  {:<lw$}{}", "license excluded", summary.excluded_license);
    }
    if summary.skipped_corrupt + summary.skipped_vanished > 0 {
        println!(
            "  {:<lw$}{}",
            "skipped",
            summary.skipped_corrupt + summary.skipped_vanished
        );
    }
}
