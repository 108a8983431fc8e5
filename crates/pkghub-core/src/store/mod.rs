//! Object storage used for package metadata, leases and the catalog document.
//!
//! Every object carries an opaque [`ObjectVersion`]. Writes can be made
//! conditional on the version currently stored ([`Precondition`]), which is
//! what leases and idempotent metadata writes build on.

pub mod memory;
pub mod remote;

pub use memory::MemoryStore;
pub use remote::OpendalStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::layout::CATALOG_KEY;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt object {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Opaque version token of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Condition a write must satisfy to be applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Precondition {
    /// Unconditional overwrite.
    #[default]
    None,
    /// Only create; fail if the key already exists.
    DoesNotExist,
    /// Only replace the object currently at this version.
    Matches(ObjectVersion),
}

impl Precondition {
    /// Precondition that replaces exactly what was observed (or creates if nothing was).
    pub fn observed(version: Option<&ObjectVersion>) -> Self {
        version.map_or(Self::DoesNotExist, |v| Self::Matches(v.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub version: ObjectVersion,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub meta: ObjectMeta,
    pub data: Bytes,
}

/// One lifecycle rule: non-current versions under `prefix` expire after `noncurrent_retention`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRule {
    pub prefix: String,
    pub noncurrent_retention: Duration,
}

/// Expiry policy for non-current object versions. The longest matching prefix wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub rules: Vec<LifecycleRule>,
}

impl LifecyclePolicy {
    pub fn new(noncurrent_days: i64, catalog_noncurrent_days: i64) -> Self {
        Self {
            rules: vec![
                LifecycleRule {
                    prefix: String::new(),
                    noncurrent_retention: Duration::days(noncurrent_days),
                },
                LifecycleRule {
                    prefix: CATALOG_KEY.to_string(),
                    noncurrent_retention: Duration::days(catalog_noncurrent_days),
                },
            ],
        }
    }

    pub fn retention_for(&self, key: &str) -> Option<Duration> {
        self.rules
            .iter()
            .filter(|r| key.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())
            .map(|r| r.noncurrent_retention)
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::new(90, 7)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Read the current version of `key`.
    async fn get(&self, key: &str) -> Result<Object, StoreError>;

    /// Metadata of the current version, or `None` if the key does not exist.
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    /// Write `data` to `key`, replacing any current version atomically.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: Precondition,
    ) -> Result<ObjectMeta, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List current objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;

    /// Read the exact version described by `meta`.
    ///
    /// Stores without version retention serve the current object when it
    /// still carries the listed version, and report `NotFound` otherwise.
    async fn get_version(&self, meta: &ObjectMeta) -> Result<Object, StoreError> {
        let object = self.get(&meta.key).await?;
        if object.meta.version == meta.version {
            Ok(object)
        } else {
            Err(StoreError::NotFound(format!("{}@{}", meta.key, meta.version)))
        }
    }

    /// Permanently remove non-current versions older than the policy allows.
    /// Returns the number of versions removed.
    async fn expire_noncurrent(
        &self,
        _policy: &LifecyclePolicy,
        _now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Read and decode a JSON object, returning `None` if it does not exist.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if the object is not valid JSON for `T`,
/// and propagates any other storage error.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<(T, ObjectMeta)>, StoreError> {
    let object = match store.get(key).await {
        Ok(object) => object,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let value = decode_json(&object)?;
    Ok(Some((value, object.meta)))
}

/// Decode an already fetched JSON object.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if the bytes do not decode as `T`.
pub fn decode_json<T: DeserializeOwned>(object: &Object) -> Result<T, StoreError> {
    serde_json::from_slice(&object.data).map_err(|e| StoreError::Corrupt {
        key: object.meta.key.clone(),
        reason: e.to_string(),
    })
}

/// Encode and write a JSON object.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if `value` cannot be serialized, and
/// propagates write errors.
pub async fn write_json<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
    precondition: Precondition,
) -> Result<ObjectMeta, StoreError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Backend(format!("failed to encode {key}: {e}")))?;
    store.put(key, Bytes::from(data), precondition).await
}

/// Open the store described by `config`.
///
/// # Errors
///
/// Returns an error if the backend cannot be initialized (e.g. missing S3
/// bucket or an unusable filesystem root).
pub fn open(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Fs => Arc::new(OpendalStore::fs(&config.root)?),
        StorageBackend::S3 => Arc::new(OpendalStore::s3(&config.s3)?),
    };
    tracing::debug!(backend = ?config.backend, "opened object store");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_longest_prefix_wins() {
        let policy = LifecyclePolicy::default();
        assert_eq!(policy.retention_for("catalog.json"), Some(Duration::days(7)));
        assert_eq!(
            policy.retention_for("data/foo/v1.0.0/metadata.json"),
            Some(Duration::days(90))
        );
    }

    #[test]
    fn observed_precondition() {
        assert_eq!(Precondition::observed(None), Precondition::DoesNotExist);
        let v = ObjectVersion::new("3");
        assert_eq!(
            Precondition::observed(Some(&v)),
            Precondition::Matches(ObjectVersion::new("3"))
        );
    }
}
