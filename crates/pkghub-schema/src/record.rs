use serde::{Deserialize, Serialize};

use crate::hash::Sha256Digest;
use crate::types::PackageIdentity;

/// What a documentation link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Project homepage.
    Homepage,
    /// Source repository.
    Repository,
    /// Issue tracker.
    Issues,
}

/// A documentation link extracted from the package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocLink {
    /// Link category.
    pub kind: LinkKind,
    /// Target URL.
    pub url: String,
}

/// Canonical extracted metadata for one [`PackageIdentity`].
///
/// Records are deterministic functions of the artifact content: reprocessing
/// the same artifact produces an equal record, which is what makes
/// re-ingestion of an identical `(identity, digest)` pair a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadataRecord {
    /// The package this record describes.
    pub identity: PackageIdentity,
    /// Short human-readable summary.
    #[serde(default)]
    pub description: String,
    /// SPDX license expression as declared by the package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Keywords, lowercased and de-duplicated, in declaration order.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Documentation links.
    #[serde(default)]
    pub links: Vec<DocLink>,
    /// Digest of the artifact the record was extracted from.
    pub content_digest: Sha256Digest,
}

impl PackageMetadataRecord {
    /// Whether this record was extracted from the artifact with `digest`.
    pub fn is_from(&self, digest: &Sha256Digest) -> bool {
        &self.content_digest == digest
    }

    /// The first link of the given kind, if any.
    pub fn link(&self, kind: LinkKind) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.kind == kind)
            .map(|l| l.url.as_str())
    }
}
