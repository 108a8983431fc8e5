//! Single-writer rebuild coordination with trailing-rebuild coalescing.
//!
//! ```text
//!            request                    request
//!   Idle ------------> Running ------------------> RunningWithPending
//!    ^                  |   ^                              |
//!    |   run finished   |   |  run finished, start again   |
//!    +------------------+   +------------------------------+
//! ```
//!
//! At most one rebuild runs at a time. A request that arrives while a run is
//! in flight does not start a second one; it marks the coordinator pending,
//! and exactly one more run starts after the current one, no matter how many
//! requests arrived in between. Requests are never dropped and never queue up
//! unboundedly.
//!
//! Every request gets a ticket. A ticket is settled by the first run whose
//! scan started after the ticket was issued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use super::builder::{CatalogBuilder, CatalogError, RebuildSummary};
use crate::orchestration::RebuildSignal;
use crate::reporter::Reporter;
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    RunningWithPending,
}

/// Published after every settled run.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildStatus {
    /// Highest ticket covered by a finished run, successful or not.
    pub settled: u64,
    /// Highest ticket covered by a successful run.
    pub completed: u64,
    pub last: Option<Result<RebuildSummary, CatalogError>>,
    pub idle: bool,
}

#[derive(Debug)]
struct Inner {
    state: CoordinatorState,
    issued: u64,
}

#[derive(Debug)]
struct Shared {
    builder: CatalogBuilder,
    reporter: Arc<dyn Reporter>,
    backoff: Backoff,
    max_attempts: u32,
    inner: Mutex<Inner>,
    status: watch::Sender<RebuildStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; clones share one state machine.
#[derive(Debug, Clone)]
pub struct RebuildCoordinator {
    shared: Arc<Shared>,
}

impl RebuildCoordinator {
    pub fn new(
        builder: CatalogBuilder,
        reporter: Arc<dyn Reporter>,
        backoff: Backoff,
        max_attempts: u32,
    ) -> Self {
        let (status, _) = watch::channel(RebuildStatus {
            settled: 0,
            completed: 0,
            last: None,
            idle: true,
        });
        Self {
            shared: Arc::new(Shared {
                builder,
                reporter,
                backoff,
                max_attempts: max_attempts.max(1),
                inner: Mutex::new(Inner {
                    state: CoordinatorState::Idle,
                    issued: 0,
                }),
                status,
            }),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.lock().state
    }

    pub fn status(&self) -> RebuildStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RebuildStatus> {
        self.shared.status.subscribe()
    }

    /// Ask for a rebuild and return its ticket.
    ///
    /// Must be called from within a Tokio runtime: going from idle to
    /// running spawns the driver task.
    pub fn request(&self) -> u64 {
        let (ticket, start) = {
            let mut inner = self.shared.lock();
            inner.issued += 1;
            let start = match inner.state {
                CoordinatorState::Idle => {
                    inner.state = CoordinatorState::Running;
                    true
                }
                CoordinatorState::Running | CoordinatorState::RunningWithPending => {
                    inner.state = CoordinatorState::RunningWithPending;
                    false
                }
            };
            (inner.issued, start)
        };

        if start {
            self.shared.status.send_modify(|s| s.idle = false);
            tokio::spawn(drive(Arc::clone(&self.shared)));
        }
        tracing::debug!(ticket, started = start, "rebuild requested");
        ticket
    }

    /// Wait until `ticket` is settled and return the outcome of the run
    /// that settled it.
    ///
    /// # Errors
    ///
    /// Returns the error of the settling run once its retries are exhausted.
    pub async fn wait_for(&self, ticket: u64) -> Result<RebuildSummary, CatalogError> {
        let mut rx = self.shared.status.subscribe();
        let status = rx
            .wait_for(|s| s.settled >= ticket)
            .await
            .map_err(|_| CatalogError::Stopped)?;
        status.last.clone().unwrap_or(Err(CatalogError::Stopped))
    }

    /// Request a rebuild and wait for it.
    ///
    /// # Errors
    ///
    /// See [`RebuildCoordinator::wait_for`].
    pub async fn rebuild_and_wait(&self) -> Result<RebuildSummary, CatalogError> {
        let ticket = self.request();
        self.wait_for(ticket).await
    }

    /// Wait until no run is in flight or pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.status.subscribe();
        let _ = rx.wait_for(|s| s.idle).await;
    }
}

impl RebuildSignal for RebuildCoordinator {
    fn signal_rebuild(&self, cause: &str) {
        tracing::trace!(cause, "rebuild signal");
        self.request();
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        // Everything issued so far is covered by the scan that starts now.
        let covers = {
            let mut inner = shared.lock();
            inner.state = CoordinatorState::Running;
            inner.issued
        };

        let result = run_with_retry(&shared).await;

        let idle = {
            let mut inner = shared.lock();
            if inner.state == CoordinatorState::RunningWithPending {
                false
            } else {
                inner.state = CoordinatorState::Idle;
                true
            }
        };

        shared.status.send_modify(|s| {
            s.settled = s.settled.max(covers);
            if result.is_ok() {
                s.completed = s.completed.max(covers);
            }
            s.last = Some(result);
            s.idle = idle;
        });

        if idle {
            break;
        }
        tracing::debug!("trailing rebuild");
    }
}

async fn run_with_retry(shared: &Shared) -> Result<RebuildSummary, CatalogError> {
    let mut attempt = 1;
    loop {
        match shared.builder.rebuild().await {
            Ok((_, summary)) => {
                shared.reporter.rebuild_completed(&summary);
                return Ok(summary);
            }
            Err(e) => {
                let will_retry = e.is_transient() && attempt < shared.max_attempts;
                shared.reporter.rebuild_failed(&e.to_string(), attempt, will_retry);
                if !will_retry {
                    tracing::error!(attempt, error = %e, "catalog rebuild abandoned, previous catalog still served");
                    return Err(e);
                }
                let delay = shared.backoff.delay(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "catalog rebuild failed");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
