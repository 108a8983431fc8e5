//! One catalog rebuild: scan, filter, sort, replace.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use pkghub_schema::{CatalogDocument, PackageMetadataRecord};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::denylist::DenyList;
use crate::layout::{CATALOG_KEY, STORAGE_KEY_PREFIX, identity_from_metadata_key};
use crate::license::LicenseList;
use crate::store::{ObjectMeta, ObjectStore, Precondition, StoreError, decode_json};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(StoreError),

    #[error("failed to write catalog: {0}")]
    Write(StoreError),

    #[error("failed to encode catalog: {0}")]
    Encode(String),

    #[error("rebuild coordinator stopped")]
    Stopped,
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Write(_))
    }
}

/// Counters for one successful rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub run: u64,
    pub built_at: DateTime<Utc>,
    /// Objects in the fixed listing under `data/`.
    pub listed: usize,
    pub included: usize,
    pub excluded_denied: usize,
    pub excluded_license: usize,
    /// Unparseable keys and records that failed to decode.
    pub skipped_corrupt: usize,
    /// Listed versions that were gone by the time they were read.
    pub skipped_vanished: usize,
}

enum Scanned {
    Record(PackageMetadataRecord),
    Corrupt,
    Vanished,
}

/// Scans per-package records and writes the catalog document.
///
/// Not safe to run twice concurrently against the same store; the
/// [`RebuildCoordinator`](super::RebuildCoordinator) serializes runs.
#[derive(Debug)]
pub struct CatalogBuilder {
    store: Arc<dyn ObjectStore>,
    deny: Arc<DenyList>,
    licenses: Arc<LicenseList>,
    read_concurrency: usize,
    runs: AtomicU64,
}

impl CatalogBuilder {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        deny: Arc<DenyList>,
        licenses: Arc<LicenseList>,
        read_concurrency: usize,
    ) -> Self {
        Self {
            store,
            deny,
            licenses,
            read_concurrency: read_concurrency.max(1),
            runs: AtomicU64::new(0),
        }
    }

    /// Build and publish a new catalog.
    ///
    /// The listing taken at the start is the snapshot: each listed object is
    /// read at its listed version, and objects written after the listing are
    /// left for the next run. Deny rules and the license policy are evaluated
    /// again for every record.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::StorageUnavailable`] if the listing or a read
    /// fails for a reason other than a missing or corrupt record, and
    /// [`CatalogError::Write`] if the document cannot be stored. In both
    /// cases the previously published catalog is untouched.
    pub async fn rebuild(&self) -> Result<(CatalogDocument, RebuildSummary), CatalogError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let built_at = Utc::now();
        let deny = self.deny.snapshot();

        let listing = self
            .store
            .list(STORAGE_KEY_PREFIX)
            .await
            .map_err(CatalogError::StorageUnavailable)?;
        tracing::debug!(run, listed = listing.len(), generation = deny.generation, "catalog scan started");

        let mut summary = RebuildSummary {
            run,
            built_at,
            listed: listing.len(),
            ..RebuildSummary::default()
        };

        let scanned: Vec<Result<Scanned, StoreError>> = stream::iter(listing)
            .map(|meta| self.read_listed(meta))
            .buffer_unordered(self.read_concurrency)
            .collect()
            .await;

        let mut records = Vec::with_capacity(scanned.len());
        for entry in scanned {
            match entry.map_err(CatalogError::StorageUnavailable)? {
                Scanned::Record(record) => {
                    if deny.evaluate(&record.identity).is_denied() {
                        summary.excluded_denied += 1;
                    } else if !self.licenses.is_allowed(record.license.as_deref()) {
                        summary.excluded_license += 1;
                    } else {
                        records.push(record);
                    }
                }
                Scanned::Corrupt => summary.skipped_corrupt += 1,
                Scanned::Vanished => summary.skipped_vanished += 1,
            }
        }
        summary.included = records.len();

        let document = CatalogDocument::new(built_at, records);
        let data = serde_json::to_vec_pretty(&document)
            .map_err(|e| CatalogError::Encode(e.to_string()))?;
        self.store
            .put(CATALOG_KEY, data.into(), Precondition::None)
            .await
            .map_err(CatalogError::Write)?;

        tracing::info!(
            run,
            included = summary.included,
            excluded_denied = summary.excluded_denied,
            excluded_license = summary.excluded_license,
            skipped = summary.skipped_corrupt + summary.skipped_vanished,
            "catalog published"
        );
        Ok((document, summary))
    }

    async fn read_listed(&self, meta: ObjectMeta) -> Result<Scanned, StoreError> {
        let Some(expected) = identity_from_metadata_key(&meta.key) else {
            tracing::warn!(key = %meta.key, "skipping unparseable key");
            return Ok(Scanned::Corrupt);
        };

        let object = match self.store.get_version(&meta).await {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(key = %meta.key, "listed record vanished");
                return Ok(Scanned::Vanished);
            }
            Err(StoreError::Corrupt { key, reason }) => {
                tracing::warn!(%key, %reason, "skipping corrupt record");
                return Ok(Scanned::Corrupt);
            }
            Err(e) => return Err(e),
        };

        match decode_json::<PackageMetadataRecord>(&object) {
            Ok(record) if record.identity == expected => Ok(Scanned::Record(record)),
            Ok(record) => {
                tracing::warn!(
                    key = %meta.key,
                    found = %record.identity,
                    "skipping record stored under another identity's key"
                );
                Ok(Scanned::Corrupt)
            }
            Err(e) => {
                tracing::warn!(key = %meta.key, error = %e, "skipping corrupt record");
                Ok(Scanned::Corrupt)
            }
        }
    }
}
