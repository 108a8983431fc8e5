//! Ingestion: the trust boundary between package sources and orchestration.
//!
//! Malformed events are rejected before they take a queue slot. Events for an
//! `(identity, digest)` pair that is already queued, or whose record is
//! already in storage, are acknowledged without enqueuing again.

use pkghub_schema::{EventError, IngestionEvent, PackageIdentity, PackageMetadataRecord, Sha256Digest};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::layout::metadata_key;
use crate::queue::{IngestionQueue, QueueError};
use crate::store::{ObjectStore, StoreError, read_json};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed input: {0}")]
    MalformedInput(#[from] EventError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { message_id: u64 },
    /// The pair is already queued or already processed.
    Duplicate,
}

type DedupKey = (PackageIdentity, Sha256Digest);

#[derive(Debug)]
pub struct Ingestion {
    store: Arc<dyn ObjectStore>,
    queue: IngestionQueue,
    in_flight: Mutex<HashSet<DedupKey>>,
}

impl Ingestion {
    pub fn new(store: Arc<dyn ObjectStore>, queue: IngestionQueue) -> Self {
        Self {
            store,
            queue,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &IngestionQueue {
        &self.queue
    }

    /// Validate, deduplicate and enqueue `event`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::MalformedInput`] for an invalid identity,
    /// artifact location or digest, and [`IngestError::Queue`] if the queue
    /// no longer accepts messages.
    pub async fn submit(&self, event: IngestionEvent) -> Result<Admission, IngestError> {
        let (_, digest) = event.validate().inspect_err(|e| {
            tracing::warn!(package = %event.identity, error = %e, "rejected malformed event");
        })?;
        let key = (event.identity.clone(), digest);

        if !self.lock().insert(key.clone()) {
            tracing::debug!(package = %event.identity, "duplicate of queued event");
            return Ok(Admission::Duplicate);
        }

        if self.already_processed(&key).await {
            self.lock().remove(&key);
            tracing::debug!(package = %event.identity, "already processed, not re-enqueuing");
            return Ok(Admission::Duplicate);
        }

        match self.queue.send(&event) {
            Ok(message_id) => {
                tracing::info!(package = %event.identity, message_id, "event enqueued");
                Ok(Admission::Accepted { message_id })
            }
            Err(e) => {
                self.lock().remove(&key);
                Err(e.into())
            }
        }
    }

    /// Forget an in-flight pair once its execution reached a terminal state.
    pub fn complete(&self, identity: &PackageIdentity, digest: &Sha256Digest) {
        self.lock().remove(&(identity.clone(), digest.clone()));
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    async fn already_processed(&self, (identity, digest): &DedupKey) -> bool {
        let key = metadata_key(identity);
        match read_json::<PackageMetadataRecord>(self.store.as_ref(), &key).await {
            Ok(Some((record, _))) => record.is_from(digest),
            Ok(None) | Err(StoreError::Corrupt { .. }) => false,
            Err(e) => {
                // Orchestration is idempotent, so enqueuing is always safe.
                tracing::warn!(package = %identity, error = %e, "dedup lookup failed, enqueuing anyway");
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<DedupKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::store::{MemoryStore, Precondition, write_json};

    fn digest() -> Sha256Digest {
        Sha256Digest::compute(b"artifact")
    }

    fn event(name: &str, version: &str) -> IngestionEvent {
        IngestionEvent::new(
            PackageIdentity::new(name, version),
            format!("store:artifacts/{name}/v{version}/package.tgz"),
            digest().prefixed(),
        )
    }

    fn ingestion() -> (Ingestion, queue::QueueReceiver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = queue::channel();
        (
            Ingestion::new(Arc::clone(&store) as Arc<dyn ObjectStore>, tx),
            rx,
            store,
        )
    }

    #[tokio::test]
    async fn rejects_malformed_events_before_queueing() {
        let (ingestion, _rx, _) = ingestion();

        let mut bad_name = event("foo", "1.0.0");
        bad_name.identity = PackageIdentity::new("", "1.0.0");
        let mut bad_location = event("foo", "1.0.0");
        bad_location.artifact_location = "ftp://example.com/foo.tgz".to_string();
        let mut bad_digest = event("foo", "1.0.0");
        bad_digest.integrity_digest = "abc".to_string();

        for e in [bad_name, bad_location, bad_digest] {
            assert!(matches!(
                ingestion.submit(e).await,
                Err(IngestError::MalformedInput(_))
            ));
        }
        assert_eq!(ingestion.queue().outstanding(), 0);
    }

    #[tokio::test]
    async fn duplicates_while_in_flight() {
        let (ingestion, _rx, _) = ingestion();
        assert!(matches!(
            ingestion.submit(event("foo", "1.0.0")).await.unwrap(),
            Admission::Accepted { .. }
        ));
        assert_eq!(
            ingestion.submit(event("foo", "1.0.0")).await.unwrap(),
            Admission::Duplicate
        );
        assert_eq!(ingestion.queue().outstanding(), 1);

        ingestion.complete(&PackageIdentity::new("foo", "1.0.0"), &digest());
        assert!(matches!(
            ingestion.submit(event("foo", "1.0.0")).await.unwrap(),
            Admission::Accepted { .. }
        ));
    }

    #[tokio::test]
    async fn processed_pairs_are_not_requeued() {
        let (ingestion, _rx, store) = ingestion();
        let identity = PackageIdentity::new("foo", "1.0.0");
        let record = PackageMetadataRecord {
            identity: identity.clone(),
            description: String::new(),
            license: Some("MIT".to_string()),
            tags: Vec::new(),
            links: Vec::new(),
            content_digest: digest(),
        };
        write_json(store.as_ref(), &metadata_key(&identity), &record, Precondition::None)
            .await
            .unwrap();

        assert_eq!(
            ingestion.submit(event("foo", "1.0.0")).await.unwrap(),
            Admission::Duplicate
        );
        assert_eq!(ingestion.in_flight(), 0);

        // Same identity, different content: re-ingested.
        let mut changed = event("foo", "1.0.0");
        changed.integrity_digest = Sha256Digest::compute(b"other").to_string();
        assert!(matches!(
            ingestion.submit(changed).await.unwrap(),
            Admission::Accepted { .. }
        ));
    }

    #[tokio::test]
    async fn store_outage_does_not_block_ingestion() {
        let (ingestion, _rx, store) = ingestion();
        store.set_unavailable(true);
        assert!(matches!(
            ingestion.submit(event("foo", "1.0.0")).await.unwrap(),
            Admission::Accepted { .. }
        ));
    }
}
