//! Catalog command

use anyhow::{Context, Result};
use comfy_table::{ContentArrangement, Table, presets};
use pkghub_core::PackageHub;

/// Print the currently served catalog
pub async fn catalog(hub: &PackageHub, json: bool) -> Result<()> {
    let catalog = hub.catalog().await.context("Failed to read catalog")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    if catalog.is_empty() {
        println!();
        println!("  No packages in the catalog.");
        println!("  Run 'pkghub submit <tarball>' to index one.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Package", "Version", "License", "Description"]);
    for record in &catalog.packages {
        table.add_row(vec![
            record.identity.name.to_string(),
            record.identity.version.to_string(),
            record.license.clone().unwrap_or_default(),
            record.description.clone(),
        ]);
    }
    println!("{table}");
    println!(
        "  {} package version(s), built {}",
        catalog.len(),
        catalog.built_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}
