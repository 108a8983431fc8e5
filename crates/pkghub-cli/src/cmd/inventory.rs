//! Inventory command

use anyhow::{Context, Result};
use pkghub_core::PackageHub;

/// Audit stored records and print the report
pub async fn inventory(hub: &PackageHub) -> Result<()> {
    let report = hub.audit().await.context("Inventory audit failed")?;
    let lw = 20;

    println!();
    println!("  {:<lw$}{}", "records", report.total_records);
    println!("  {:<lw$}{}", "packages", report.packages);
    println!("  {:<lw$}{}", "denied", report.denied.len());
    println!("  {:<lw$}{}", "license excluded", report.ineligible_license.len());
    println!("  {:<lw$}{}", "corrupt", report.corrupt.len());
    println!("  {:<lw$}{}", "unparseable keys", report.unparseable_keys.len());

    for identity in &report.denied {
        println!("    denied   {identity}");
    }
    for identity in &report.ineligible_license {
        println!("    license  {identity}");
    }
    for key in report.corrupt.iter().chain(&report.unparseable_keys) {
        println!("    skipped  {key}");
    }
    Ok(())
}
