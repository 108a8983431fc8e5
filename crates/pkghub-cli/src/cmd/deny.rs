//! Deny list commands

use anyhow::{Context, Result, bail};
use comfy_table::{Table, presets};
use pkghub_core::PackageHub;
use pkghub_schema::DenyRule;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct DenyFile {
    #[serde(default)]
    deny: Vec<DenyRule>,
}

/// Print the rules in evaluation order
pub fn show(hub: &PackageHub) -> Result<()> {
    let rules = hub.deny_list().rules();
    if rules.is_empty() {
        println!("  No deny rules.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_header(vec!["Package", "Version", "Reason"]);
    for rule in &rules {
        table.add_row(vec![
            rule.package.to_string(),
            rule.version.clone().unwrap_or_else(|| "*".to_string()),
            rule.reason.clone(),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Replace the rules and wait for the catalog to reflect them
pub async fn set(hub: &PackageHub, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let parsed: DenyFile =
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", file.display()))?;
    for rule in &parsed.deny {
        if let Err(e) = rule.package.validate() {
            bail!("Invalid deny rule: {e}");
        }
    }

    let update = hub.update_deny_rules(parsed.deny).await?;
    if update.change.is_empty() {
        println!("  Deny list unchanged.");
        return Ok(());
    }
    println!(
        "  Deny list updated (generation {}): {} added, {} removed",
        update.change.generation,
        update.change.added.len(),
        update.change.removed.len()
    );
    if let Some(prune) = &update.prune {
        for identity in &prune.denied {
            println!("    removing {identity}");
        }
    }

    if let Some(ticket) = update.ticket {
        let summary = hub
            .wait_for_rebuild(ticket)
            .await
            .context("Rules were saved but the catalog rebuild failed")?;
        super::rebuild::print_summary(&summary);
    }
    Ok(())
}
