//! Egress: completion and failure signals for observability collaborators.
//!
//! The pipeline takes an `Arc<dyn Reporter>` and never knows where signals
//! go. Logging, a broadcast channel for in-process subscribers and a no-op
//! sink are provided here.

use pkghub_schema::PackageIdentity;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::catalog::RebuildSummary;
use crate::denylist::PruneEvent;
use crate::inventory::InventoryReport;
use crate::orchestration::{ExecutionOutcome, ExecutionReport};

pub trait Reporter: Send + Sync + fmt::Debug {
    /// An execution reached a terminal state (persisted, rejected or failed).
    fn execution_finished(&self, report: &ExecutionReport);

    /// An attempt hit a transient fault and was handed back to the queue.
    fn execution_retrying(&self, identity: &PackageIdentity, attempt: u32, reason: &str);

    fn rebuild_completed(&self, summary: &RebuildSummary);

    /// A rebuild attempt failed; the previous catalog is still served.
    fn rebuild_failed(&self, error: &str, attempt: u32, will_retry: bool);

    /// A deny list update left denied records in storage.
    fn pruned(&self, event: &PruneEvent);

    fn inventory_completed(&self, report: &InventoryReport);
}

impl<T: Reporter + ?Sized> Reporter for Arc<T> {
    fn execution_finished(&self, report: &ExecutionReport) {
        (**self).execution_finished(report);
    }
    fn execution_retrying(&self, identity: &PackageIdentity, attempt: u32, reason: &str) {
        (**self).execution_retrying(identity, attempt, reason);
    }
    fn rebuild_completed(&self, summary: &RebuildSummary) {
        (**self).rebuild_completed(summary);
    }
    fn rebuild_failed(&self, error: &str, attempt: u32, will_retry: bool) {
        (**self).rebuild_failed(error, attempt, will_retry);
    }
    fn pruned(&self, event: &PruneEvent) {
        (**self).pruned(event);
    }
    fn inventory_completed(&self, report: &InventoryReport) {
        (**self).inventory_completed(report);
    }
}

/// Fan-out to several reporters in order.
impl<R: Reporter> Reporter for Vec<R> {
    fn execution_finished(&self, report: &ExecutionReport) {
        self.iter().for_each(|r| r.execution_finished(report));
    }
    fn execution_retrying(&self, identity: &PackageIdentity, attempt: u32, reason: &str) {
        self.iter()
            .for_each(|r| r.execution_retrying(identity, attempt, reason));
    }
    fn rebuild_completed(&self, summary: &RebuildSummary) {
        self.iter().for_each(|r| r.rebuild_completed(summary));
    }
    fn rebuild_failed(&self, error: &str, attempt: u32, will_retry: bool) {
        self.iter()
            .for_each(|r| r.rebuild_failed(error, attempt, will_retry));
    }
    fn pruned(&self, event: &PruneEvent) {
        self.iter().for_each(|r| r.pruned(event));
    }
    fn inventory_completed(&self, report: &InventoryReport) {
        self.iter().for_each(|r| r.inventory_completed(report));
    }
}

/// A no-op reporter for silent operation (e.g., one-shot CLI commands, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn execution_finished(&self, _: &ExecutionReport) {}
    fn execution_retrying(&self, _: &PackageIdentity, _: u32, _: &str) {}
    fn rebuild_completed(&self, _: &RebuildSummary) {}
    fn rebuild_failed(&self, _: &str, _: u32, _: bool) {}
    fn pruned(&self, _: &PruneEvent) {}
    fn inventory_completed(&self, _: &InventoryReport) {}
}

/// Turns signals into `tracing` events under the `pkghub::egress` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn execution_finished(&self, report: &ExecutionReport) {
        match &report.outcome {
            ExecutionOutcome::Persisted { changed } => tracing::info!(
                target: "pkghub::egress",
                package = %report.identity,
                attempts = report.attempts,
                changed,
                "execution persisted"
            ),
            ExecutionOutcome::Rejected { reason } => tracing::warn!(
                target: "pkghub::egress",
                package = %report.identity,
                %reason,
                "execution rejected"
            ),
            ExecutionOutcome::Failed { reason } => tracing::error!(
                target: "pkghub::egress",
                package = %report.identity,
                attempts = report.attempts,
                %reason,
                "execution failed"
            ),
        }
    }

    fn execution_retrying(&self, identity: &PackageIdentity, attempt: u32, reason: &str) {
        tracing::debug!(target: "pkghub::egress", package = %identity, attempt, reason, "execution retrying");
    }

    fn rebuild_completed(&self, summary: &RebuildSummary) {
        tracing::info!(
            target: "pkghub::egress",
            run = summary.run,
            listed = summary.listed,
            included = summary.included,
            excluded_denied = summary.excluded_denied,
            excluded_license = summary.excluded_license,
            skipped_corrupt = summary.skipped_corrupt,
            "catalog rebuilt"
        );
    }

    fn rebuild_failed(&self, error: &str, attempt: u32, will_retry: bool) {
        if will_retry {
            tracing::warn!(target: "pkghub::egress", attempt, error, "catalog rebuild failed, retrying");
        } else {
            tracing::error!(target: "pkghub::egress", attempt, error, "catalog rebuild failed");
        }
    }

    fn pruned(&self, event: &PruneEvent) {
        tracing::info!(
            target: "pkghub::egress",
            generation = event.generation,
            denied = event.denied.len(),
            "denied records scheduled for removal from the catalog"
        );
    }

    fn inventory_completed(&self, report: &InventoryReport) {
        tracing::info!(
            target: "pkghub::egress",
            records = report.total_records,
            packages = report.packages,
            corrupt = report.corrupt.len(),
            unparseable = report.unparseable_keys.len(),
            "inventory audit complete"
        );
    }
}

/// Owned copy of one egress signal.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    ExecutionFinished(ExecutionReport),
    ExecutionRetrying {
        identity: PackageIdentity,
        attempt: u32,
        reason: String,
    },
    RebuildCompleted(RebuildSummary),
    RebuildFailed {
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    Pruned(PruneEvent),
    InventoryCompleted(InventoryReport),
}

/// Broadcasts every signal as a [`HubEvent`]. Slow subscribers lag and
/// lose the oldest events; sending never blocks the pipeline.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: broadcast::Sender<HubEvent>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for ChannelReporter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Reporter for ChannelReporter {
    fn execution_finished(&self, report: &ExecutionReport) {
        self.emit(HubEvent::ExecutionFinished(report.clone()));
    }
    fn execution_retrying(&self, identity: &PackageIdentity, attempt: u32, reason: &str) {
        self.emit(HubEvent::ExecutionRetrying {
            identity: identity.clone(),
            attempt,
            reason: reason.to_string(),
        });
    }
    fn rebuild_completed(&self, summary: &RebuildSummary) {
        self.emit(HubEvent::RebuildCompleted(summary.clone()));
    }
    fn rebuild_failed(&self, error: &str, attempt: u32, will_retry: bool) {
        self.emit(HubEvent::RebuildFailed {
            error: error.to_string(),
            attempt,
            will_retry,
        });
    }
    fn pruned(&self, event: &PruneEvent) {
        self.emit(HubEvent::Pruned(event.clone()));
    }
    fn inventory_completed(&self, report: &InventoryReport) {
        self.emit(HubEvent::InventoryCompleted(report.clone()));
    }
}
