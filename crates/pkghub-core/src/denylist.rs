//! Deny list: exclusion rules and their evaluation.
//!
//! Rules are kept as an immutable snapshot behind a lock and swapped as a
//! whole on update, so an evaluation never sees half of an update. Every
//! update bumps a generation observable through [`DenyList::subscribe`].
//!
//! The deny list never deletes anything from storage. Denied records are
//! excluded by the next catalog rebuild, which re-evaluates every record.

use pkghub_schema::{DenyRule, PackageIdentity};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

use crate::layout::{DENY_LIST_KEY, STORAGE_KEY_PREFIX, identity_from_metadata_key};
use crate::store::{ObjectStore, Precondition, StoreError, read_json, write_json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied { rule: DenyRule },
}

impl Verdict {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Denied { rule } => Some(&rule.reason),
        }
    }
}

/// Classify `identity` against `rules`.
///
/// Exact `name@version` rules take precedence over whole-package rules.
/// Within each kind the first matching rule in list order wins.
pub fn evaluate(rules: &[DenyRule], identity: &PackageIdentity) -> Verdict {
    rules
        .iter()
        .find(|r| r.matches_exact(identity))
        .or_else(|| rules.iter().find(|r| r.matches_name(identity)))
        .map_or(Verdict::Allowed, |rule| Verdict::Denied { rule: rule.clone() })
}

/// Immutable view of the rules at one generation.
#[derive(Debug, Clone, Default)]
pub struct DenySnapshot {
    pub generation: u64,
    pub rules: Arc<Vec<DenyRule>>,
}

impl DenySnapshot {
    pub fn evaluate(&self, identity: &PackageIdentity) -> Verdict {
        evaluate(&self.rules, identity)
    }
}

/// What an update changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChange {
    pub generation: u64,
    pub added: Vec<DenyRule>,
    pub removed: Vec<DenyRule>,
}

impl RuleChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Identities present in storage that are denied under the rules of `generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneEvent {
    pub generation: u64,
    pub denied: Vec<PackageIdentity>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DenyListDocument {
    rules: Vec<DenyRule>,
}

#[derive(Debug)]
pub struct DenyList {
    store: Arc<dyn ObjectStore>,
    current: RwLock<DenySnapshot>,
    changes: watch::Sender<u64>,
    /// Held across persisting and swapping so the live rules always match
    /// the last document written.
    updates: tokio::sync::Mutex<()>,
}

impl DenyList {
    /// A deny list with `rules`, not yet persisted.
    pub fn new(store: Arc<dyn ObjectStore>, rules: Vec<DenyRule>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            store,
            current: RwLock::new(DenySnapshot {
                generation: 0,
                rules: Arc::new(rules),
            }),
            changes,
            updates: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the persisted deny list, falling back to `initial` when none
    /// has been stored yet.
    ///
    /// # Errors
    ///
    /// Propagates storage errors, including a corrupt `deny-list.json`.
    pub async fn load(
        store: Arc<dyn ObjectStore>,
        initial: Vec<DenyRule>,
    ) -> Result<Self, StoreError> {
        let rules = match read_json::<DenyListDocument>(store.as_ref(), DENY_LIST_KEY).await? {
            Some((doc, _)) => {
                tracing::debug!(rules = doc.rules.len(), "loaded persisted deny list");
                doc.rules
            }
            None => initial,
        };
        Ok(Self::new(store, rules))
    }

    pub fn snapshot(&self) -> DenySnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rules(&self) -> Vec<DenyRule> {
        self.snapshot().rules.as_ref().clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn evaluate(&self, identity: &PackageIdentity) -> Verdict {
        self.snapshot().evaluate(identity)
    }

    /// Receiver that observes the generation of every rule update.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Replace the rule set.
    ///
    /// The new rules are persisted first; the in-memory snapshot is swapped
    /// only once they are durable. Concurrent updates apply one at a time.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the rules cannot be persisted, in which
    /// case the previous rules stay in effect.
    pub async fn update_rules(&self, rules: Vec<DenyRule>) -> Result<RuleChange, StoreError> {
        let _update = self.updates.lock().await;
        let doc = DenyListDocument { rules };
        write_json(self.store.as_ref(), DENY_LIST_KEY, &doc, Precondition::None).await?;
        let rules = doc.rules;

        let (previous, generation) = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let previous = Arc::clone(&current.rules);
            current.generation += 1;
            current.rules = Arc::new(rules.clone());
            (previous, current.generation)
        };

        let added: Vec<DenyRule> = rules
            .iter()
            .filter(|r| !previous.contains(r))
            .cloned()
            .collect();
        let removed: Vec<DenyRule> = previous
            .iter()
            .filter(|r| !rules.contains(r))
            .cloned()
            .collect();

        self.changes.send_replace(generation);
        tracing::info!(
            generation,
            added = added.len(),
            removed = removed.len(),
            "deny list updated"
        );
        Ok(RuleChange {
            generation,
            added,
            removed,
        })
    }

    /// Identities with a metadata record in storage that the current rules deny.
    ///
    /// # Errors
    ///
    /// Propagates listing failures.
    pub async fn prune_set(&self) -> Result<PruneEvent, StoreError> {
        let snapshot = self.snapshot();
        let listing = self.store.list(STORAGE_KEY_PREFIX).await?;
        let mut denied: Vec<PackageIdentity> = listing
            .iter()
            .filter_map(|meta| identity_from_metadata_key(&meta.key))
            .filter(|identity| snapshot.evaluate(identity).is_denied())
            .collect();
        denied.sort();
        Ok(PruneEvent {
            generation: snapshot.generation,
            denied,
        })
    }
}
