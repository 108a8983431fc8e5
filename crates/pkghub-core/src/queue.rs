//! At-least-once work queue between ingestion and orchestration.
//!
//! Message bodies are serialized [`IngestionEvent`]s. A [`Delivery`] must be
//! settled with [`Delivery::ack`] once its event reached a terminal state, or
//! handed back with [`Delivery::retry`]. A delivery dropped without being
//! settled (a panicking or cancelled worker) is redelivered.

use pkghub_schema::IngestionEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
struct Message {
    id: u64,
    body: String,
    attempt: u32,
}

#[derive(Debug, Clone)]
pub struct IngestionQueue {
    tx: mpsc::UnboundedSender<Message>,
    next_id: Arc<AtomicU64>,
    outstanding: Arc<watch::Sender<usize>>,
}

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    queue: IngestionQueue,
}

/// Create a connected queue and receiver.
pub fn channel() -> (IngestionQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (outstanding, _) = watch::channel(0);
    let queue = IngestionQueue {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
        outstanding: Arc::new(outstanding),
    };
    let receiver = QueueReceiver {
        rx,
        queue: queue.clone(),
    };
    (queue, receiver)
}

impl IngestionQueue {
    /// Enqueue `event`, returning its message id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the receiver is gone.
    pub fn send(&self, event: &IngestionEvent) -> Result<u64, QueueError> {
        let body = serde_json::to_string(event)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding.send_modify(|n| *n += 1);
        if self.tx.send(Message { id, body, attempt: 1 }).is_err() {
            self.settle();
            return Err(QueueError::Closed);
        }
        Ok(id)
    }

    /// Messages sent and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until every sent message has been acknowledged.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn redeliver(&self, mut message: Message) {
        message.attempt += 1;
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            tracing::warn!(message_id = message.id, "queue closed, dropping redelivery");
            self.settle();
        }
    }

    fn settle(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl QueueReceiver {
    /// Next delivery.
    ///
    /// The receiver keeps a sender for redeliveries, so this waits while the
    /// queue is empty; consumers stop on their own shutdown signal.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let message = self.rx.recv().await?;
        Some(Delivery {
            message: Some(message),
            queue: self.queue.clone(),
        })
    }
}

#[derive(Debug)]
pub struct Delivery {
    message: Option<Message>,
    queue: IngestionQueue,
}

impl Delivery {
    pub fn id(&self) -> u64 {
        self.message.as_ref().map_or(0, |m| m.id)
    }

    /// 1 for the first delivery, incremented on every redelivery.
    pub fn attempt(&self) -> u32 {
        self.message.as_ref().map_or(0, |m| m.attempt)
    }

    /// Decode the message body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for a body that is not an [`IngestionEvent`].
    pub fn decode(&self) -> Result<IngestionEvent, serde_json::Error> {
        let body = self.message.as_ref().map_or("", |m| m.body.as_str());
        serde_json::from_str(body)
    }

    /// Settle the message; it will not be delivered again.
    pub fn ack(mut self) {
        if self.message.take().is_some() {
            self.queue.settle();
        }
    }

    /// Deliver the message again after `delay`.
    pub fn retry(mut self, delay: Duration) {
        let Some(message) = self.message.take() else {
            return;
        };
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.redeliver(message);
        });
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            tracing::warn!(message_id = message.id, "delivery dropped unsettled, redelivering");
            self.queue.redeliver(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkghub_schema::{PackageIdentity, Sha256Digest};

    fn event(name: &str) -> IngestionEvent {
        IngestionEvent::new(
            PackageIdentity::new(name, "1.0.0"),
            format!("store:artifacts/{name}/v1.0.0/package.tgz"),
            Sha256Digest::compute(name.as_bytes()).to_string(),
        )
    }

    #[tokio::test]
    async fn ack_settles() {
        let (queue, mut rx) = channel();
        let sent = event("foo");
        let id = queue.send(&sent).unwrap();
        assert_eq!(queue.outstanding(), 1);

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.id(), id);
        assert_eq!(delivery.attempt(), 1);
        assert_eq!(delivery.decode().unwrap(), sent);
        delivery.ack();
        assert_eq!(queue.outstanding(), 0);
        queue.wait_idle().await;
    }

    #[tokio::test]
    async fn retry_and_drop_redeliver() {
        let (queue, mut rx) = channel();
        queue.send(&event("foo")).unwrap();

        rx.recv().await.unwrap().retry(Duration::from_millis(5));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.attempt(), 2);

        drop(second);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.attempt(), 3);
        assert_eq!(queue.outstanding(), 1);
        third.ack();
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects() {
        let (queue, rx) = channel();
        drop(rx);
        assert!(matches!(queue.send(&event("foo")), Err(QueueError::Closed)));
        assert_eq!(queue.outstanding(), 0);
    }
}
