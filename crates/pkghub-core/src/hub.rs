//! Composition of the whole pipeline.

use anyhow::{Context, Result};
use chrono::Utc;
use pkghub_schema::{CatalogDocument, DenyRule, IngestionEvent};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::catalog::{
    CatalogBuilder, CatalogError, RebuildCoordinator, RebuildSummary, load_catalog,
};
use crate::config::HubConfig;
use crate::denylist::{DenyList, PruneEvent, RuleChange};
use crate::fetch::RoutingFetcher;
use crate::ingestion::{Admission, IngestError, Ingestion};
use crate::inventory::{Inventory, InventoryReport};
use crate::lease::LeaseManager;
use crate::license::LicenseList;
use crate::orchestration::{Orchestrator, OrchestratorSettings};
use crate::queue::{self, QueueReceiver};
use crate::reporter::{ChannelReporter, HubEvent, Reporter, TracingReporter};
use crate::retry::Backoff;
use crate::store::{ObjectStore, StoreError};

/// Result of a deny list update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyUpdate {
    pub change: RuleChange,
    /// Stored identities denied under the new rules. `None` if the store
    /// could not be listed.
    pub prune: Option<PruneEvent>,
    /// Ticket of the rebuild that applies the update, if one was needed.
    pub ticket: Option<u64>,
}

#[derive(Debug)]
pub struct PackageHub {
    config: HubConfig,
    store: Arc<dyn ObjectStore>,
    deny: Arc<DenyList>,
    ingestion: Arc<Ingestion>,
    orchestrator: Arc<Orchestrator>,
    coordinator: RebuildCoordinator,
    inventory: Arc<Inventory>,
    reporter: Arc<dyn Reporter>,
    events: ChannelReporter,
    receiver: Mutex<Option<QueueReceiver>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PackageHub {
    /// Wire the pipeline over `store`. Nothing runs until [`PackageHub::start`].
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unreadable persisted deny list or
    /// an HTTP client that cannot be built.
    pub async fn new(config: HubConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        Self::with_reporter(config, store, None).await
    }

    /// Like [`PackageHub::new`], with `extra` receiving every egress signal
    /// alongside the built-in logging and broadcast reporters.
    ///
    /// # Errors
    ///
    /// See [`PackageHub::new`].
    pub async fn with_reporter(
        config: HubConfig,
        store: Arc<dyn ObjectStore>,
        extra: Option<Arc<dyn Reporter>>,
    ) -> Result<Self> {
        config.validate()?;

        let deny = Arc::new(
            DenyList::load(Arc::clone(&store), config.deny.clone())
                .await
                .context("Failed to load deny list")?,
        );
        let licenses = Arc::new(LicenseList::new(&config.licenses.allowed));

        let events = ChannelReporter::default();
        let mut sinks: Vec<Arc<dyn Reporter>> =
            vec![Arc::new(TracingReporter), Arc::new(events.clone())];
        sinks.extend(extra);
        let reporter: Arc<dyn Reporter> = Arc::new(sinks);

        let builder = CatalogBuilder::new(
            Arc::clone(&store),
            Arc::clone(&deny),
            Arc::clone(&licenses),
            config.catalog.read_concurrency,
        );
        let coordinator = RebuildCoordinator::new(
            builder,
            Arc::clone(&reporter),
            Backoff::from_millis(config.catalog.backoff_base_ms, config.catalog.backoff_max_ms),
            config.catalog.max_attempts,
        );

        let (tx, rx) = queue::channel();
        let ingestion = Arc::new(Ingestion::new(Arc::clone(&store), tx));

        let fetcher = RoutingFetcher::from_config(Arc::clone(&store), &config.fetch)
            .context("Failed to build artifact fetcher")?;
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::new(fetcher),
            Arc::clone(&deny),
            Arc::clone(&licenses),
            LeaseManager::new(Arc::clone(&store), config.orchestration.lease_ttl()),
            Arc::clone(&ingestion),
            Arc::new(coordinator.clone()),
            Arc::clone(&reporter),
            OrchestratorSettings::from(&config.orchestration),
        ));

        let inventory = Arc::new(Inventory::new(
            Arc::clone(&store),
            Arc::clone(&deny),
            licenses,
            Arc::clone(&reporter),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            deny,
            ingestion,
            orchestrator,
            coordinator,
            inventory,
            reporter,
            events,
            receiver: Mutex::new(Some(rx)),
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Start the orchestration worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(rx) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let handle = tokio::spawn(
            Arc::clone(&self.orchestrator).run(rx, self.shutdown.subscribe()),
        );
        self.track(handle);
    }

    /// Run the inventory audit on its configured interval until shutdown.
    pub fn spawn_inventory(&self) {
        let interval = Duration::from_secs(self.config.inventory.interval_secs.max(1));
        let handle = tokio::spawn(
            Arc::clone(&self.inventory).run_periodic(interval, self.shutdown.subscribe()),
        );
        self.track(handle);
    }

    /// Expire non-current versions on the inventory interval until shutdown.
    ///
    /// Only this process can reach an in-memory store, so a long-running
    /// pipeline has to prune its own old versions.
    pub fn spawn_lifecycle(&self) {
        let interval = Duration::from_secs(self.config.inventory.interval_secs.max(1));
        let store = Arc::clone(&self.store);
        let policy = self.config.lifecycle.policy();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                match store.expire_noncurrent(&policy, Utc::now()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "expired non-current versions"),
                    Err(e) => tracing::warn!(error = %e, "version expiry failed"),
                }
            }
            tracing::debug!("lifecycle loop stopped");
        });
        self.track(handle);
    }

    /// # Errors
    ///
    /// See [`Ingestion::submit`].
    pub async fn submit(&self, event: IngestionEvent) -> Result<Admission, IngestError> {
        self.ingestion.submit(event).await
    }

    /// Replace the deny rules and schedule the rebuild that applies them.
    ///
    /// # Errors
    ///
    /// Fails if the new rules cannot be persisted; the old rules then stay
    /// in effect and no rebuild is requested.
    pub async fn update_deny_rules(&self, rules: Vec<DenyRule>) -> Result<DenyUpdate> {
        let change = self
            .deny
            .update_rules(rules)
            .await
            .context("Failed to persist deny list")?;

        if change.is_empty() {
            return Ok(DenyUpdate {
                change,
                prune: None,
                ticket: None,
            });
        }

        let prune = match self.deny.prune_set().await {
            Ok(prune) => {
                self.reporter.pruned(&prune);
                Some(prune)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not compute prune set");
                None
            }
        };
        // Removed rules can bring records back, so any change rebuilds.
        let ticket = self.coordinator.request();
        Ok(DenyUpdate {
            change,
            prune,
            ticket: Some(ticket),
        })
    }

    pub fn request_rebuild(&self) -> u64 {
        self.coordinator.request()
    }

    /// # Errors
    ///
    /// Returns the rebuild error once its retries are exhausted.
    pub async fn wait_for_rebuild(&self, ticket: u64) -> Result<RebuildSummary, CatalogError> {
        self.coordinator.wait_for(ticket).await
    }

    /// # Errors
    ///
    /// Returns the rebuild error once its retries are exhausted.
    pub async fn rebuild_and_wait(&self) -> Result<RebuildSummary, CatalogError> {
        self.coordinator.rebuild_and_wait().await
    }

    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn catalog(&self) -> Result<CatalogDocument, StoreError> {
        load_catalog(self.store.as_ref()).await
    }

    /// # Errors
    ///
    /// See [`Inventory::audit_and_store`].
    pub async fn audit(&self) -> Result<InventoryReport, StoreError> {
        self.inventory.audit_and_store().await
    }

    /// Expire non-current object versions per the lifecycle policy.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn prune_versions(&self) -> Result<usize, StoreError> {
        self.store
            .expire_noncurrent(&self.config.lifecycle.policy(), Utc::now())
            .await
    }

    /// Wait until every queued event reached a terminal state and the
    /// rebuilds they triggered have finished.
    pub async fn drain(&self) {
        self.ingestion.queue().wait_idle().await;
        self.coordinator.wait_idle().await;
    }

    /// Stop the workers after their in-flight executions finish, then wait
    /// for any running rebuild.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
        self.coordinator.wait_idle().await;
        tracing::info!("pkghub stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn deny_list(&self) -> &DenyList {
        &self.deny
    }

    pub fn coordinator(&self) -> &RebuildCoordinator {
        &self.coordinator
    }

    pub fn ingestion(&self) -> &Ingestion {
        &self.ingestion
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}
