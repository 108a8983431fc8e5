use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{DigestError, Sha256Digest};
use crate::types::{IdentityError, PackageIdentity};

/// Where an artifact can be fetched from.
///
/// The wire form is an opaque string: `store:<key>` for an object in the
/// granted artifact store, or an `http(s)://` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactLocation {
    /// An object key inside the artifact store.
    Store {
        /// Object key, relative to the store root.
        key: String,
    },
    /// A URL on a granted artifact host.
    Http {
        /// Full `http://` or `https://` URL.
        url: String,
    },
}

impl ArtifactLocation {
    /// Parse an opaque artifact reference.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnreadableLocation`] for empty references,
    /// unknown schemes, URLs without a host, and store keys that escape the
    /// store root.
    pub fn parse(raw: &str) -> Result<Self, EventError> {
        let raw = raw.trim();
        let unreadable = |reason: &'static str| EventError::UnreadableLocation {
            location: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(unreadable("empty reference"));
        }

        if let Some(key) = raw.strip_prefix("store:") {
            let key = key.trim_start_matches('/');
            if key.is_empty() {
                return Err(unreadable("empty store key"));
            }
            if key.split('/').any(|segment| segment == ".." || segment.is_empty()) {
                return Err(unreadable("store key must not contain '..' or empty segments"));
            }
            return Ok(Self::Store {
                key: key.to_string(),
            });
        }

        if let Some(rest) = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"))
        {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            if host.is_empty() {
                return Err(unreadable("url without host"));
            }
            return Ok(Self::Http {
                url: raw.to_string(),
            });
        }

        Err(unreadable("unsupported scheme (expected store: or http(s)://)"))
    }
}

impl std::fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store { key } => write!(f, "store:{key}"),
            Self::Http { url } => write!(f, "{url}"),
        }
    }
}

impl std::str::FromStr for ArtifactLocation {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors that make an [`IngestionEvent`] malformed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The package identity is missing or invalid.
    #[error("invalid identity: {0}")]
    Identity(#[from] IdentityError),

    /// The artifact reference cannot be interpreted.
    #[error("unreadable artifact location '{location}': {reason}")]
    UnreadableLocation {
        /// The raw reference.
        location: String,
        /// Why it could not be read.
        reason: &'static str,
    },

    /// The integrity digest is not a SHA256 digest.
    #[error("invalid integrity digest: {0}")]
    Digest(#[from] DigestError),
}

/// A newly observed package artifact, as produced by a package source.
///
/// Events are never mutated after creation. Fields are carried in their raw
/// form so that a malformed event can still be represented and rejected at
/// the ingestion boundary; [`IngestionEvent::validate`] yields the typed
/// location and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionEvent {
    /// The package this artifact claims to be.
    pub identity: PackageIdentity,
    /// Opaque artifact reference (see [`ArtifactLocation`]).
    pub artifact_location: String,
    /// When the source observed the artifact.
    pub received_at: DateTime<Utc>,
    /// Declared content hash of the artifact.
    pub integrity_digest: String,
}

impl IngestionEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        identity: PackageIdentity,
        artifact_location: impl Into<String>,
        integrity_digest: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            artifact_location: artifact_location.into(),
            received_at: Utc::now(),
            integrity_digest: integrity_digest.into(),
        }
    }

    /// Validate the event shape and return its typed location and digest.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the identity, artifact location or digest
    /// is malformed.
    pub fn validate(&self) -> Result<(ArtifactLocation, Sha256Digest), EventError> {
        self.identity.validate()?;
        let location = ArtifactLocation::parse(&self.artifact_location)?;
        let digest = Sha256Digest::new(self.integrity_digest.as_str())?;
        Ok((location, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> String {
        Sha256Digest::compute(b"artifact").to_string()
    }

    #[test]
    fn parses_locations() {
        assert_eq!(
            ArtifactLocation::parse("store:artifacts/foo/v1.0.0/package.tgz").unwrap(),
            ArtifactLocation::Store {
                key: "artifacts/foo/v1.0.0/package.tgz".to_string()
            }
        );
        assert!(matches!(
            ArtifactLocation::parse("https://registry.example.com/foo/-/foo-1.0.0.tgz"),
            Ok(ArtifactLocation::Http { .. })
        ));
        assert!(ArtifactLocation::parse("").is_err());
        assert!(ArtifactLocation::parse("ftp://host/file").is_err());
        assert!(ArtifactLocation::parse("https:///nohost").is_err());
        assert!(ArtifactLocation::parse("store:../escape").is_err());
    }

    #[test]
    fn location_display_round_trips() {
        let raw = "store:artifacts/foo.tgz";
        assert_eq!(ArtifactLocation::parse(raw).unwrap().to_string(), raw);
    }

    #[test]
    fn validate_accepts_well_formed_event() {
        let event = IngestionEvent::new(
            PackageIdentity::new("foo", "1.0.0"),
            "store:artifacts/foo.tgz",
            digest(),
        );
        let (location, parsed) = event.validate().unwrap();
        assert!(matches!(location, ArtifactLocation::Store { .. }));
        assert_eq!(parsed.to_string(), digest());
    }

    #[test]
    fn validate_rejects_missing_identity() {
        let event = IngestionEvent::new(PackageIdentity::new("", ""), "store:a", digest());
        assert!(matches!(event.validate(), Err(EventError::Identity(_))));
    }

    #[test]
    fn validate_rejects_bad_digest() {
        let event = IngestionEvent::new(PackageIdentity::new("foo", "1.0.0"), "store:a", "abc");
        assert!(matches!(event.validate(), Err(EventError::Digest(_))));
    }
}
