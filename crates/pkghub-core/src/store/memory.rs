//! Versioned in-process object store.
//!
//! Used for tests and single-process deployments. Behaves like a versioned
//! bucket: overwrites and deletes keep the previous version as non-current
//! until the lifecycle policy expires it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{LifecyclePolicy, Object, ObjectMeta, ObjectStore, ObjectVersion, Precondition, StoreError};

#[derive(Debug)]
struct NoncurrentVersion {
    object: Object,
    since: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    current: BTreeMap<String, Object>,
    noncurrent: Vec<NoncurrentVersion>,
    next_version: u64,
}

impl MemoryState {
    fn retire(&mut self, key: &str, now: DateTime<Utc>) {
        if let Some(object) = self.current.remove(key) {
            self.noncurrent.push(NoncurrentVersion { object, since: now });
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with [`StoreError::Unavailable`]
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of retained non-current versions of `key`.
    pub fn noncurrent_versions(&self, key: &str) -> usize {
        self.lock()
            .noncurrent
            .iter()
            .filter(|v| v.object.meta.key == key)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Object, StoreError> {
        self.check_available()?;
        self.lock()
            .current
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        self.check_available()?;
        Ok(self.lock().current.get(key).map(|o| o.meta.clone()))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: Precondition,
    ) -> Result<ObjectMeta, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.lock();

        let current = state.current.get(key).map(|o| &o.meta.version);
        let satisfied = match &precondition {
            Precondition::None => true,
            Precondition::DoesNotExist => current.is_none(),
            Precondition::Matches(expected) => current == Some(expected),
        };
        if !satisfied {
            return Err(StoreError::PreconditionFailed(key.to_string()));
        }

        state.next_version += 1;
        let meta = ObjectMeta {
            key: key.to_string(),
            version: ObjectVersion::new(state.next_version.to_string()),
            size: data.len() as u64,
            last_modified: Some(now),
        };
        state.retire(key, now);
        state.current.insert(
            key.to_string(),
            Object {
                meta: meta.clone(),
                data,
            },
        );
        Ok(meta)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().retire(key, Utc::now());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .current
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, o)| o.meta.clone())
            .collect())
    }

    async fn get_version(&self, meta: &ObjectMeta) -> Result<Object, StoreError> {
        self.check_available()?;
        let state = self.lock();
        if let Some(object) = state
            .current
            .get(&meta.key)
            .filter(|o| o.meta.version == meta.version)
        {
            return Ok(object.clone());
        }
        state
            .noncurrent
            .iter()
            .find(|v| v.object.meta.key == meta.key && v.object.meta.version == meta.version)
            .map(|v| v.object.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{}@{}", meta.key, meta.version)))
    }

    async fn expire_noncurrent(
        &self,
        policy: &LifecyclePolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let before = state.noncurrent.len();
        state.noncurrent.retain(|v| {
            policy
                .retention_for(&v.object.meta.key)
                .is_none_or(|retention| now - v.since < retention)
        });
        Ok(before - state.noncurrent.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn put_get_and_versions() {
        let store = MemoryStore::new();
        let first = store
            .put("a", Bytes::from_static(b"1"), Precondition::DoesNotExist)
            .await
            .unwrap();
        let second = store
            .put("a", Bytes::from_static(b"2"), Precondition::Matches(first.version.clone()))
            .await
            .unwrap();
        assert_ne!(first.version, second.version);

        let current = store.get("a").await.unwrap();
        assert_eq!(&current.data[..], b"2");

        // The old version is still readable by version.
        let old = store.get_version(&first).await.unwrap();
        assert_eq!(&old.data[..], b"1");
        assert_eq!(store.noncurrent_versions("a"), 1);
    }

    #[tokio::test]
    async fn preconditions_are_enforced() {
        let store = MemoryStore::new();
        store
            .put("a", Bytes::from_static(b"1"), Precondition::None)
            .await
            .unwrap();
        let err = store
            .put("a", Bytes::from_static(b"2"), Precondition::DoesNotExist)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PreconditionFailed("a".to_string()));

        let err = store
            .put(
                "a",
                Bytes::from_static(b"2"),
                Precondition::Matches(ObjectVersion::new("999")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let store = MemoryStore::new();
        for key in ["data/b", "data/a", "other/c", "data0"] {
            store
                .put(key, Bytes::from_static(b"x"), Precondition::None)
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
        assert_eq!(keys, vec!["data/a", "data/b"]);
    }

    #[tokio::test]
    async fn delete_retains_noncurrent_and_lifecycle_expires_it() {
        let store = MemoryStore::new();
        store
            .put("catalog.json", Bytes::from_static(b"{}"), Precondition::None)
            .await
            .unwrap();
        store
            .put("catalog.json", Bytes::from_static(b"{ }"), Precondition::None)
            .await
            .unwrap();
        store
            .put("data/x", Bytes::from_static(b"x"), Precondition::None)
            .await
            .unwrap();
        store.delete("data/x").await.unwrap();
        assert!(store.stat("data/x").await.unwrap().is_none());

        let policy = LifecyclePolicy::default();
        let removed = store
            .expire_noncurrent(&policy, Utc::now() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.noncurrent_versions("catalog.json"), 0);
        assert_eq!(store.noncurrent_versions("data/x"), 1);

        let removed = store
            .expire_noncurrent(&policy, Utc::now() + Duration::days(91))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn outage_is_transient() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.list("").await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.list("").await.unwrap().is_empty());
    }
}
