//! Inventory audit of the package store.
//!
//! A read-only pass over `data/` that counts what is stored and flags what
//! the catalog builder would skip or exclude. Runs on demand or on an
//! interval, and again whenever the deny list changes.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use pkghub_schema::{PackageIdentity, PackageMetadataRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::denylist::DenyList;
use crate::layout::{INVENTORY_KEY, STORAGE_KEY_PREFIX, identity_from_metadata_key};
use crate::license::LicenseList;
use crate::reporter::Reporter;
use crate::store::{ObjectStore, Precondition, StoreError, read_json, write_json};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReport {
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,
    /// Distinct package names.
    pub packages: usize,
    pub unparseable_keys: Vec<String>,
    pub corrupt: Vec<String>,
    pub denied: Vec<PackageIdentity>,
    pub ineligible_license: Vec<PackageIdentity>,
}

enum Entry {
    Record(PackageMetadataRecord),
    Unparseable(String),
    Corrupt(String),
    Gone,
}

#[derive(Debug)]
pub struct Inventory {
    store: Arc<dyn ObjectStore>,
    deny: Arc<DenyList>,
    licenses: Arc<LicenseList>,
    reporter: Arc<dyn Reporter>,
}

impl Inventory {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        deny: Arc<DenyList>,
        licenses: Arc<LicenseList>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            store,
            deny,
            licenses,
            reporter,
        }
    }

    /// # Errors
    ///
    /// Fails if the listing fails or a record cannot be read for a reason
    /// other than corruption.
    pub async fn audit(&self) -> Result<InventoryReport, StoreError> {
        let generated_at = Utc::now();
        let deny = self.deny.snapshot();
        let listing = self.store.list(STORAGE_KEY_PREFIX).await?;

        let entries: Vec<Result<Entry, StoreError>> = stream::iter(listing)
            .map(|meta| async move {
                let Some(expected) = identity_from_metadata_key(&meta.key) else {
                    return Ok(Entry::Unparseable(meta.key));
                };
                match read_json::<PackageMetadataRecord>(self.store.as_ref(), &meta.key).await {
                    Ok(Some((record, _))) if record.identity == expected => {
                        Ok(Entry::Record(record))
                    }
                    Ok(Some(_)) | Err(StoreError::Corrupt { .. }) => Ok(Entry::Corrupt(meta.key)),
                    Ok(None) => Ok(Entry::Gone),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(16)
            .collect()
            .await;

        let mut report = InventoryReport {
            generated_at,
            ..InventoryReport::default()
        };
        let mut names = BTreeSet::new();
        for entry in entries {
            match entry? {
                Entry::Record(record) => {
                    report.total_records += 1;
                    names.insert(record.identity.name.clone());
                    if deny.evaluate(&record.identity).is_denied() {
                        report.denied.push(record.identity);
                    } else if !self.licenses.is_allowed(record.license.as_deref()) {
                        report.ineligible_license.push(record.identity);
                    }
                }
                Entry::Unparseable(key) => report.unparseable_keys.push(key),
                Entry::Corrupt(key) => report.corrupt.push(key),
                Entry::Gone => {}
            }
        }
        report.packages = names.len();
        report.unparseable_keys.sort();
        report.corrupt.sort();
        report.denied.sort();
        report.ineligible_license.sort();
        Ok(report)
    }

    /// Audit, store the report as `inventory.json` and report it.
    ///
    /// # Errors
    ///
    /// See [`Inventory::audit`]; also fails if the report cannot be written.
    pub async fn audit_and_store(&self) -> Result<InventoryReport, StoreError> {
        let report = self.audit().await?;
        write_json(self.store.as_ref(), INVENTORY_KEY, &report, Precondition::None).await?;
        self.reporter.inventory_completed(&report);
        Ok(report)
    }

    /// Audit every `interval` and after every deny list change until
    /// `shutdown` turns true.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deny_changes = self.deny.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = deny_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::debug!(generation = *deny_changes.borrow(), "deny list changed, auditing");
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            if let Err(e) = self.audit_and_store().await {
                tracing::warn!(error = %e, "inventory audit failed");
            }
        }
        tracing::debug!("inventory loop stopped");
    }
}
