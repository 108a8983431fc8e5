//! Orchestration: turns queued ingestion events into persisted metadata.
//!
//! ```text
//! Received -> Validating -> DenyCheck -> Extracting -> Persisted
//!     |            |             |             |
//!     +------------+-------------+-------------+--> Rejected (terminal)
//!                                              +--> Retryable -> ... -> Failed
//! ```
//!
//! Executions run concurrently up to a global ceiling. Executions for the
//! same identity are serialized through a storage lease, so they never
//! interleave writes even across processes. Every attempt is bounded by a
//! hard timeout; a timed-out attempt is retryable and never leaves a partial
//! record behind because the record is written in one conditional put.

pub mod flow;

use pkghub_schema::{IngestionEvent, PackageIdentity, Sha256Digest};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::config::OrchestrationConfig;
use crate::denylist::DenyList;
use crate::fetch::ArtifactFetcher;
use crate::ingestion::Ingestion;
use crate::layout::metadata_key;
use crate::lease::LeaseManager;
use crate::license::LicenseList;
use crate::queue::{Delivery, QueueReceiver};
use crate::reporter::Reporter;
use crate::retry::Backoff;
use crate::store::ObjectStore;
use flow::{Halt, Received};

/// Execution states, recorded in order in [`ExecutionReport::trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validating,
    DenyCheck,
    Extracting,
    Persisted,
    Rejected,
    Retryable,
    Failed,
}

/// Terminal rejection causes. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    MalformedInput(String),
    IntegrityMismatch {
        expected: Sha256Digest,
        actual: Option<Sha256Digest>,
        detail: String,
    },
    DenyListed {
        reason: String,
    },
    InvalidPackageFormat(String),
    IneligibleLicense {
        license: Option<String>,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedInput(detail) => write!(f, "malformed input: {detail}"),
            Self::IntegrityMismatch { detail, .. } => write!(f, "integrity mismatch: {detail}"),
            Self::DenyListed { reason } => write!(f, "deny-listed: {reason}"),
            Self::InvalidPackageFormat(detail) => write!(f, "invalid package format: {detail}"),
            Self::IneligibleLicense { license } => write!(
                f,
                "ineligible license: {}",
                license.as_deref().unwrap_or("none declared")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Persisted { changed: bool },
    Rejected { reason: RejectReason },
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub identity: PackageIdentity,
    pub message_id: u64,
    pub attempts: u32,
    pub outcome: ExecutionOutcome,
    /// States visited by the final attempt.
    pub trace: Vec<Stage>,
}

/// Receives "something changed, rebuild the catalog" signals.
pub trait RebuildSignal: Send + Sync + fmt::Debug {
    fn signal_rebuild(&self, cause: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub concurrency: usize,
    pub backoff: Backoff,
}

impl From<&OrchestrationConfig> for OrchestratorSettings {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            timeout: config.timeout(),
            concurrency: config.concurrency.max(1),
            backoff: Backoff::from_millis(config.backoff_base_ms, config.backoff_max_ms),
        }
    }
}

enum Attempt {
    Done(ExecutionOutcome),
    Retry(String),
}

#[derive(Debug)]
pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    deny: Arc<DenyList>,
    licenses: Arc<LicenseList>,
    leases: LeaseManager,
    ingestion: Arc<Ingestion>,
    rebuild: Arc<dyn RebuildSignal>,
    reporter: Arc<dyn Reporter>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        deny: Arc<DenyList>,
        licenses: Arc<LicenseList>,
        leases: LeaseManager,
        ingestion: Arc<Ingestion>,
        rebuild: Arc<dyn RebuildSignal>,
        reporter: Arc<dyn Reporter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            deny,
            licenses,
            leases,
            ingestion,
            rebuild,
            reporter,
            settings,
        }
    }

    /// Consume deliveries until `shutdown` turns true (or its sender is
    /// dropped), then wait for in-flight executions to finish.
    pub async fn run(self: Arc<Self>, mut rx: QueueReceiver, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        tracing::info!(concurrency = self.settings.concurrency, "orchestrator started");

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => permit,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            let Ok(permit) = permit else { break };

            let delivery = tokio::select! {
                delivery = rx.recv() => delivery,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            let Some(delivery) = delivery else { break };

            let this = Arc::clone(&self);
            tasks.spawn(async move {
                this.handle(delivery).await;
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "execution task panicked");
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "orchestrator stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "execution task panicked");
            }
        }
    }

    /// Process one delivery to a terminal state or hand it back for retry.
    pub async fn handle(&self, delivery: Delivery) {
        let attempt = delivery.attempt();
        let event = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                // Nothing to retry: the body will never decode.
                tracing::error!(message_id = delivery.id(), error = %e, "undecodable message");
                delivery.ack();
                return;
            }
        };

        let mut trace = Vec::new();
        let result = self.execute(&event, &mut trace).await;

        let outcome = match result {
            Attempt::Done(outcome) => outcome,
            Attempt::Retry(reason) if attempt < self.settings.max_attempts => {
                let delay = self.settings.backoff.delay(attempt);
                tracing::warn!(
                    package = %event.identity,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "execution retryable"
                );
                self.reporter
                    .execution_retrying(&event.identity, attempt, &reason);
                delivery.retry(delay);
                return;
            }
            Attempt::Retry(reason) => {
                trace.push(Stage::Failed);
                ExecutionOutcome::Failed { reason }
            }
        };

        self.finish(delivery, &event, attempt, outcome, trace);
    }

    fn finish(
        &self,
        delivery: Delivery,
        event: &IngestionEvent,
        attempts: u32,
        outcome: ExecutionOutcome,
        trace: Vec<Stage>,
    ) {
        if let Ok(digest) = Sha256Digest::new(event.integrity_digest.as_str()) {
            self.ingestion.complete(&event.identity, &digest);
        }

        let report = ExecutionReport {
            identity: event.identity.clone(),
            message_id: delivery.id(),
            attempts,
            outcome,
            trace,
        };
        match &report.outcome {
            ExecutionOutcome::Persisted { changed } => {
                tracing::info!(package = %report.identity, changed, attempts, "persisted");
            }
            ExecutionOutcome::Rejected { reason } => {
                tracing::warn!(package = %report.identity, %reason, "rejected");
            }
            ExecutionOutcome::Failed { reason } => {
                tracing::error!(package = %report.identity, attempts, %reason, "failed");
            }
        }
        self.reporter.execution_finished(&report);
        delivery.ack();
    }

    async fn execute(&self, event: &IngestionEvent, trace: &mut Vec<Stage>) -> Attempt {
        trace.push(Stage::Received);
        let identity = &event.identity;

        // The lease key is derived from the identity, so it must be valid first.
        if let Err(e) = identity.validate() {
            trace.push(Stage::Rejected);
            return Attempt::Done(ExecutionOutcome::Rejected {
                reason: RejectReason::MalformedInput(e.to_string()),
            });
        }

        let lease = match self.leases.acquire(identity).await {
            Ok(lease) => lease,
            Err(e) => {
                trace.push(Stage::Retryable);
                return Attempt::Retry(e.to_string());
            }
        };

        let staged = tokio::time::timeout(
            self.settings.timeout,
            self.run_stages(Received::new(event.clone()), &lease, trace),
        )
        .await;

        if let Err(e) = lease.release().await {
            tracing::warn!(package = %identity, error = %e, "failed to release lease");
        }

        match staged {
            Ok(Ok(outcome)) => Attempt::Done(outcome),
            Ok(Err(Halt::Reject(reason))) => {
                trace.push(Stage::Rejected);
                Attempt::Done(ExecutionOutcome::Rejected { reason })
            }
            Ok(Err(Halt::Retry(reason))) => {
                trace.push(Stage::Retryable);
                Attempt::Retry(reason)
            }
            Err(_) => {
                trace.push(Stage::Retryable);
                Attempt::Retry(format!(
                    "timed out after {}s",
                    self.settings.timeout.as_secs_f64()
                ))
            }
        }
    }

    async fn run_stages(
        &self,
        received: Received,
        lease: &crate::lease::LeaseGuard,
        trace: &mut Vec<Stage>,
    ) -> Result<ExecutionOutcome, Halt> {
        let identity = received.identity().clone();

        trace.push(Stage::Validating);
        let validated = received.validate(self.fetcher.as_ref()).await?;

        trace.push(Stage::DenyCheck);
        let allowed = match validated.deny_check(&self.deny) {
            Ok(allowed) => allowed,
            Err(halt) => {
                self.mark_denied_record(&identity).await;
                return Err(halt);
            }
        };

        trace.push(Stage::Extracting);
        let extracted = allowed.extract(&self.licenses).await?;

        let persisted = extracted.persist(self.store.as_ref(), lease).await?;
        trace.push(Stage::Persisted);

        if persisted.changed {
            self.rebuild.signal_rebuild("metadata persisted");
        }
        Ok(ExecutionOutcome::Persisted {
            changed: persisted.changed,
        })
    }

    /// A denied identity may still have a record from before the rule
    /// existed; the next rebuild drops it from the catalog.
    async fn mark_denied_record(&self, identity: &PackageIdentity) {
        match self.store.stat(&metadata_key(identity)).await {
            Ok(None) => {}
            Ok(Some(_)) => self.rebuild.signal_rebuild("denied package has a stored record"),
            Err(e) => {
                tracing::debug!(package = %identity, error = %e, "stat failed, rebuilding anyway");
                self.rebuild.signal_rebuild("denied package may have a stored record");
            }
        }
    }
}
