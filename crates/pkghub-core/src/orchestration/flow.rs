//! Execution flow typestate.
//!
//! One ingestion event moves through explicit states:
//! `Received` -> `Validated` -> `Allowed` -> `Extracted` -> persisted.
//!
//! Each transition consumes the previous state, so a record cannot be
//! persisted without having passed integrity validation, the deny check and
//! extraction. A failed transition halts the flow with either a terminal
//! rejection or a retryable fault.

use bytes::Bytes;
use pkghub_schema::{IngestionEvent, PackageIdentity, PackageMetadataRecord, Sha256Digest};

use super::RejectReason;
use crate::denylist::{DenyList, Verdict};
use crate::extract::{ExtractError, extract_record_blocking};
use crate::fetch::ArtifactFetcher;
use crate::layout::metadata_key;
use crate::lease::LeaseGuard;
use crate::license::LicenseList;
use crate::store::{
    ObjectStore, ObjectVersion, Precondition, StoreError, decode_json, write_json,
};

/// Why a flow stopped before persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// Terminal; retrying cannot change the result.
    Reject(RejectReason),
    /// Transient infrastructure fault.
    Retry(String),
}

impl From<StoreError> for Halt {
    fn from(e: StoreError) -> Self {
        Self::Retry(e.to_string())
    }
}

/// Step 1: an event taken off the queue.
#[derive(Debug)]
pub struct Received {
    event: IngestionEvent,
}

/// Step 2: the artifact was fetched and matches its declared digest.
#[derive(Debug)]
pub struct Validated {
    pub identity: PackageIdentity,
    pub digest: Sha256Digest,
    artifact: Bytes,
}

/// Step 3: the deny list allows the identity.
#[derive(Debug)]
pub struct Allowed {
    validated: Validated,
}

/// Step 4: metadata was extracted and passed the license policy.
#[derive(Debug)]
pub struct Extracted {
    pub record: PackageMetadataRecord,
}

/// Result of a successful persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persisted {
    /// False when storage already held an identical record.
    pub changed: bool,
}

impl Received {
    pub fn new(event: IngestionEvent) -> Self {
        Self { event }
    }

    pub fn identity(&self) -> &PackageIdentity {
        &self.event.identity
    }

    /// Fetch the artifact and check it against the declared digest.
    ///
    /// # Errors
    ///
    /// Rejects with `MalformedInput` for an invalid event and with
    /// `IntegrityMismatch` when the artifact is unfetchable or its digest
    /// differs. Transient fetch failures are retryable.
    pub async fn validate(self, fetcher: &dyn ArtifactFetcher) -> Result<Validated, Halt> {
        let (location, expected) = self
            .event
            .validate()
            .map_err(|e| Halt::Reject(RejectReason::MalformedInput(e.to_string())))?;

        let artifact = match fetcher.fetch(&location).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_transient() => return Err(Halt::Retry(e.to_string())),
            Err(e) => {
                return Err(Halt::Reject(RejectReason::IntegrityMismatch {
                    expected,
                    actual: None,
                    detail: e.to_string(),
                }));
            }
        };

        let actual = Sha256Digest::compute(&artifact);
        if actual != expected {
            return Err(Halt::Reject(RejectReason::IntegrityMismatch {
                expected,
                actual: Some(actual),
                detail: "artifact content does not match the declared digest".to_string(),
            }));
        }

        Ok(Validated {
            identity: self.event.identity,
            digest: expected,
            artifact,
        })
    }
}

impl Validated {
    /// # Errors
    ///
    /// Rejects with `DenyListed` when a rule matches.
    pub fn deny_check(self, deny: &DenyList) -> Result<Allowed, Halt> {
        match deny.evaluate(&self.identity) {
            Verdict::Allowed => Ok(Allowed { validated: self }),
            Verdict::Denied { rule } => Err(Halt::Reject(RejectReason::DenyListed {
                reason: rule.reason,
            })),
        }
    }
}

impl Allowed {
    /// Parse the artifact and apply the license policy.
    ///
    /// # Errors
    ///
    /// Rejects with `InvalidPackageFormat` or `IneligibleLicense`; a failed
    /// extraction task is retryable.
    pub async fn extract(self, licenses: &LicenseList) -> Result<Extracted, Halt> {
        let Validated {
            identity,
            digest,
            artifact,
        } = self.validated;

        let record = match extract_record_blocking(identity, digest, artifact).await {
            Ok(record) => record,
            Err(e @ ExtractError::Internal(_)) => return Err(Halt::Retry(e.to_string())),
            Err(e) => {
                return Err(Halt::Reject(RejectReason::InvalidPackageFormat(
                    e.to_string(),
                )));
            }
        };

        if !licenses.is_allowed(record.license.as_deref()) {
            return Err(Halt::Reject(RejectReason::IneligibleLicense {
                license: record.license,
            }));
        }
        Ok(Extracted { record })
    }
}

impl Extracted {
    /// Write the record under its identity key.
    ///
    /// An identical stored record makes this a no-op. Otherwise the lease is
    /// revalidated and the record written conditionally on the version that
    /// was read, so a concurrent writer is detected instead of overwritten.
    ///
    /// # Errors
    ///
    /// Storage faults, a lost lease and a lost write race are retryable.
    pub async fn persist(
        self,
        store: &dyn ObjectStore,
        lease: &LeaseGuard,
    ) -> Result<Persisted, Halt> {
        let key = metadata_key(&self.record.identity);

        let (existing, observed) = read_current(store, &key).await?;
        if existing.as_ref() == Some(&self.record) {
            return Ok(Persisted { changed: false });
        }

        lease
            .validate()
            .await
            .map_err(|e| Halt::Retry(e.to_string()))?;

        match write_json(
            store,
            &key,
            &self.record,
            Precondition::observed(observed.as_ref()),
        )
        .await
        {
            Ok(_) => Ok(Persisted { changed: true }),
            Err(StoreError::PreconditionFailed(_)) => {
                let (current, _) = read_current(store, &key).await?;
                if current.as_ref() == Some(&self.record) {
                    Ok(Persisted { changed: false })
                } else {
                    Err(Halt::Retry(format!("concurrent write to {key}")))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Current record at `key` and its version. A corrupt record reads as
/// absent but keeps its version, so it is replaced conditionally.
async fn read_current(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<(Option<PackageMetadataRecord>, Option<ObjectVersion>), Halt> {
    match store.get(key).await {
        Ok(object) => {
            let record = decode_json::<PackageMetadataRecord>(&object)
                .inspect_err(|e| tracing::warn!(%key, error = %e, "overwriting corrupt record"))
                .ok();
            Ok((record, Some(object.meta.version)))
        }
        Err(StoreError::NotFound(_)) => Ok((None, None)),
        Err(e) => Err(e.into()),
    }
}
