//! [`ObjectStore`] over an `opendal` operator (local filesystem or S3/R2).
//!
//! Object versions come from the backend etag when it has one. Backends
//! without etags (the local filesystem) use the SHA256 of the content, so a
//! version always identifies exactly one body.
//!
//! Preconditions are checked with a `stat` immediately before the write,
//! with both steps held under a per-key lock so writers sharing one store
//! are serialized. Other processes are not covered by that lock; multi-writer
//! S3 deployments should keep leases short. Non-current version expiry is
//! left to the bucket lifecycle configuration.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{EntryMode, ErrorKind, Operator, services};
use pkghub_schema::Sha256Digest;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use super::{Object, ObjectMeta, ObjectStore, ObjectVersion, Precondition, StoreError};
use crate::config::S3Settings;

type KeyLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Clone)]
pub struct OpendalStore {
    op: Operator,
    locks: Arc<KeyLocks>,
}

/// Write lock on one key; the map entry goes away with the last holder.
struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl OpendalStore {
    pub fn new(op: Operator) -> Self {
        Self {
            op,
            locks: Arc::default(),
        }
    }

    async fn lock_key(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        KeyGuard {
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Store rooted at a local directory. Writes go through a temporary
    /// directory and are renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the directory cannot be created.
    pub fn fs(root: &Path) -> Result<Self, StoreError> {
        let staging = root.join(".staging");
        std::fs::create_dir_all(&staging)
            .map_err(|e| StoreError::Backend(format!("cannot create {}: {e}", root.display())))?;

        let mut builder = services::Fs::default();
        builder.root(&root.to_string_lossy());
        builder.atomic_write_dir(&staging.to_string_lossy());
        let op = Operator::new(builder).map_err(map_err)?.finish();
        Ok(Self::new(op))
    }

    /// Store backed by an S3-compatible bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if no bucket is configured or the
    /// operator cannot be built.
    pub fn s3(settings: &S3Settings) -> Result<Self, StoreError> {
        let Some(bucket) = settings.bucket.as_deref() else {
            return Err(StoreError::Backend("s3 backend requires a bucket".to_string()));
        };

        let mut builder = services::S3::default();
        builder.bucket(bucket);
        if let Some(endpoint) = &settings.endpoint {
            builder.endpoint(endpoint);
        }
        if let Some(access_key) = &settings.access_key_id {
            builder.access_key_id(access_key);
        }
        if let Some(secret_key) = &settings.secret_access_key {
            builder.secret_access_key(secret_key);
        }
        builder.region(&settings.region);

        let op = Operator::new(builder).map_err(map_err)?.finish();
        Ok(Self::new(op))
    }

    /// Non-persistent store on opendal's memory service.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the operator cannot be built.
    pub fn memory() -> Result<Self, StoreError> {
        let op = Operator::new(services::Memory::default())
            .map_err(map_err)?
            .finish();
        Ok(Self::new(op))
    }

    fn meta_for(key: &str, meta: &opendal::Metadata, data: Option<&[u8]>) -> ObjectMeta {
        let version = match (meta.etag(), data) {
            (Some(etag), _) => etag.trim_matches('"').to_string(),
            (None, Some(data)) => Sha256Digest::compute(data).to_string(),
            (None, None) => String::new(),
        };
        ObjectMeta {
            key: key.to_string(),
            version: ObjectVersion::new(version),
            size: data.map_or_else(|| meta.content_length(), |d| d.len() as u64),
            last_modified: meta.last_modified(),
        }
    }

    async fn current_meta(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let meta = match self.op.stat(key).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(map_err(e)),
        };
        if meta.etag().is_some() {
            return Ok(Some(Self::meta_for(key, &meta, None)));
        }
        match self.op.read(key).await {
            Ok(data) => Ok(Some(Self::meta_for(key, &meta, Some(&data)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn get(&self, key: &str) -> Result<Object, StoreError> {
        let data = self.op.read(key).await.map_err(map_err)?;
        let meta = self.op.stat(key).await.map_err(map_err)?;
        Ok(Object {
            meta: Self::meta_for(key, &meta, Some(&data)),
            data: Bytes::from(data),
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        self.current_meta(key).await
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: Precondition,
    ) -> Result<ObjectMeta, StoreError> {
        let _guard = self.lock_key(key).await;
        if precondition != Precondition::None {
            let current = self.current_meta(key).await?;
            let satisfied = match &precondition {
                Precondition::None => true,
                Precondition::DoesNotExist => current.is_none(),
                Precondition::Matches(expected) => {
                    current.as_ref().is_some_and(|m| &m.version == expected)
                }
            };
            if !satisfied {
                return Err(StoreError::PreconditionFailed(key.to_string()));
            }
        }

        self.op.write(key, data.clone()).await.map_err(map_err)?;
        let meta = self.op.stat(key).await.map_err(map_err)?;
        Ok(Self::meta_for(key, &meta, Some(&data)))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock_key(key).await;
        self.op.delete(key).await.map_err(map_err)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        // opendal lists directories; walk the deepest directory containing the prefix.
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..=idx],
            None => "/",
        };
        let entries = match self.op.list_with(dir).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_err(e)),
        };

        let mut metas = Vec::new();
        for entry in entries {
            let path = entry.path().trim_start_matches('/');
            if entry.metadata().mode() != EntryMode::FILE
                || !path.starts_with(prefix)
                || path.starts_with(".staging/")
            {
                continue;
            }
            // Objects deleted between the listing and the stat are skipped.
            if let Some(meta) = self.current_meta(path).await? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}

fn map_err(e: opendal::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound(e.to_string())
    } else if e.is_temporary() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_roundtrip_and_cas() {
        let dir = tempdir().unwrap();
        let store = OpendalStore::fs(dir.path()).unwrap();

        let first = store
            .put(
                "data/foo/v1.0.0/metadata.json",
                Bytes::from_static(b"{\"a\":1}"),
                Precondition::DoesNotExist,
            )
            .await
            .unwrap();

        let err = store
            .put(
                "data/foo/v1.0.0/metadata.json",
                Bytes::from_static(b"{}"),
                Precondition::DoesNotExist,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        store
            .put(
                "data/foo/v1.0.0/metadata.json",
                Bytes::from_static(b"{\"a\":2}"),
                Precondition::Matches(first.version.clone()),
            )
            .await
            .unwrap();

        let object = store.get("data/foo/v1.0.0/metadata.json").await.unwrap();
        assert_eq!(&object.data[..], b"{\"a\":2}");
        assert_ne!(object.meta.version, first.version);
    }

    #[tokio::test]
    async fn fs_list_filters_prefix_and_staging() {
        let dir = tempdir().unwrap();
        let store = OpendalStore::fs(dir.path()).unwrap();
        for key in ["data/b/v1/metadata.json", "data/a/v1/metadata.json", "catalog.json"] {
            store
                .put(key, Bytes::from_static(b"{}"), Precondition::None)
                .await
                .unwrap();
        }

        let keys: Vec<String> = store
            .list("data/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["data/a/v1/metadata.json", "data/b/v1/metadata.json"]);

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn missing_objects() {
        let dir = tempdir().unwrap();
        let store = OpendalStore::fs(dir.path()).unwrap();
        assert!(store.stat("nope.json").await.unwrap().is_none());
        assert!(matches!(
            store.get("nope.json").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list("data/").await.unwrap().is_empty());
        store.delete("nope.json").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fs_conditional_create_has_one_winner() {
        let dir = tempdir().unwrap();
        let store = OpendalStore::fs(dir.path()).unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16u8 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .put("leases/foo/v1.0.0.json", Bytes::from(vec![i]), Precondition::DoesNotExist)
                    .await
            });
        }
        let mut won = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(matches!(e, StoreError::PreconditionFailed(_))),
            }
        }
        assert_eq!(won, 1);
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn s3_requires_bucket() {
        let err = OpendalStore::s3(&S3Settings::default()).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
