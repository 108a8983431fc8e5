//! Per-identity execution leases with fencing tokens.
//!
//! A lease is a small JSON object at `leases/<name>/v<version>.json` written
//! with a compare-and-swap against the version that was read. Each
//! acquisition increments the fencing token; a holder revalidates its token
//! before writing metadata, so an execution that outlived its lease can never
//! overwrite the work of the execution that took over.

use chrono::{DateTime, Utc};
use pkghub_schema::PackageIdentity;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::layout::lease_key;
use crate::store::{ObjectStore, ObjectVersion, Precondition, StoreError, decode_json, write_json};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease for {identity} is held by another execution")]
    Held { identity: String },

    #[error("stale fencing token for {identity}: expected {expected}, found {found:?}")]
    StaleFencingToken {
        identity: String,
        expected: u64,
        found: Option<u64>,
    },

    #[error("lease for {identity} expired at {expires_at}")]
    Expired {
        identity: String,
        expires_at: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// Whether the execution should be retried later. Losing a lease is
    /// always retryable; the next attempt sees whatever the new holder wrote.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: Arc<dyn ObjectStore>,
    ttl: chrono::Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Acquire the lease for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Held`] if another execution holds an unexpired
    /// lease or wins the race for it, and [`LeaseError::Store`] on storage
    /// failures.
    pub async fn acquire(&self, identity: &PackageIdentity) -> Result<LeaseGuard, LeaseError> {
        let key = lease_key(identity);
        let now = Utc::now();

        let (current, observed) = match self.store.get(&key).await {
            Ok(object) => match decode_json::<LeaseRecord>(&object) {
                Ok(record) => (Some(record), Some(object.meta.version)),
                Err(e) => {
                    tracing::warn!(package = %identity, error = %e, "replacing unreadable lease");
                    (None, Some(object.meta.version))
                }
            },
            Err(StoreError::NotFound(_)) => (None, None),
            Err(e) => return Err(e.into()),
        };

        if current.as_ref().is_some_and(|r| !r.is_expired(now)) {
            return Err(LeaseError::Held {
                identity: identity.to_string(),
            });
        }

        let record = LeaseRecord {
            holder: format!("{:016x}", rand::random::<u64>()),
            token: current.map_or(0, |r| r.token) + 1,
            expires_at: now + self.ttl,
        };

        let precondition = Precondition::observed(observed.as_ref());
        match write_json(self.store.as_ref(), &key, &record, precondition).await {
            Ok(meta) => {
                tracing::trace!(package = %identity, token = record.token, "lease acquired");
                Ok(LeaseGuard {
                    store: Arc::clone(&self.store),
                    key,
                    identity: identity.clone(),
                    record,
                    version: meta.version,
                })
            }
            Err(StoreError::PreconditionFailed(_)) => Err(LeaseError::Held {
                identity: identity.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// A held lease. Release it explicitly; an unreleased lease simply expires.
#[derive(Debug)]
pub struct LeaseGuard {
    store: Arc<dyn ObjectStore>,
    key: String,
    identity: PackageIdentity,
    record: LeaseRecord,
    version: ObjectVersion,
}

impl LeaseGuard {
    pub fn token(&self) -> u64 {
        self.record.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }

    /// Check that this guard still holds the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Expired`] once the lease ran out and
    /// [`LeaseError::StaleFencingToken`] if another holder replaced it.
    pub async fn validate(&self) -> Result<(), LeaseError> {
        if self.record.is_expired(Utc::now()) {
            return Err(LeaseError::Expired {
                identity: self.identity.to_string(),
                expires_at: self.record.expires_at,
            });
        }

        let found = match self.store.get(&self.key).await {
            Ok(object) => decode_json::<LeaseRecord>(&object).ok(),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match found {
            Some(current) if current == self.record => Ok(()),
            other => Err(LeaseError::StaleFencingToken {
                identity: self.identity.to_string(),
                expected: self.record.token,
                found: other.map(|r| r.token),
            }),
        }
    }

    /// Give the lease up. The token is kept so the next holder's token is
    /// still strictly greater.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] if the release cannot be written. A lease
    /// already taken over by someone else is not an error.
    pub async fn release(self) -> Result<(), LeaseError> {
        let released = LeaseRecord {
            expires_at: Utc::now(),
            ..self.record.clone()
        };
        match write_json(
            self.store.as_ref(),
            &self.key,
            &released,
            Precondition::Matches(self.version.clone()),
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::PreconditionFailed(_)) => {
                tracing::debug!(package = %self.identity, "lease already taken over");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
