use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::PackageMetadataRecord;
use crate::types::PackageIdentity;

/// Current version of the catalog document layout.
pub const CATALOG_SCHEMA_VERSION: u32 = 1;

/// The single aggregated, served index of all currently allowed packages.
///
/// Always replaced as a whole; `packages` is sorted by `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDocument {
    /// Layout version, see [`CATALOG_SCHEMA_VERSION`].
    pub schema_version: u32,
    /// When the rebuild that produced this document started its scan.
    pub built_at: DateTime<Utc>,
    /// Allowed packages, sorted by identity.
    pub packages: Vec<PackageMetadataRecord>,
}

impl CatalogDocument {
    /// Build a document from records, sorting them by identity.
    ///
    /// The sort is stable, so the result does not depend on the order in
    /// which records were listed from storage.
    pub fn new(built_at: DateTime<Utc>, mut packages: Vec<PackageMetadataRecord>) -> Self {
        packages.sort_by(|a, b| a.identity.cmp(&b.identity));
        Self {
            schema_version: CATALOG_SCHEMA_VERSION,
            built_at,
            packages,
        }
    }

    /// An empty catalog, served before the first successful rebuild.
    pub fn empty() -> Self {
        Self::new(DateTime::<Utc>::default(), Vec::new())
    }

    /// Whether `identity` is listed.
    pub fn contains(&self, identity: &PackageIdentity) -> bool {
        self.packages
            .binary_search_by(|r| r.identity.cmp(identity))
            .is_ok()
    }

    /// All listed versions of the package `name`, in ascending order.
    pub fn versions_of<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a PackageMetadataRecord> + 'a {
        self.packages
            .iter()
            .filter(move |r| r.identity.name == name)
    }

    /// Number of listed package versions.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the catalog lists nothing.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Digest;

    fn record(name: &str, version: &str) -> PackageMetadataRecord {
        PackageMetadataRecord {
            identity: PackageIdentity::new(name, version),
            description: String::new(),
            license: Some("MIT".to_string()),
            tags: Vec::new(),
            links: Vec::new(),
            content_digest: Sha256Digest::compute(format!("{name}{version}").as_bytes()),
        }
    }

    #[test]
    fn sorting_is_independent_of_input_order() {
        let a = vec![record("foo", "1.10.0"), record("bar", "1.0.0"), record("foo", "1.2.0")];
        let mut b = a.clone();
        b.reverse();

        let built_at = Utc::now();
        let doc_a = CatalogDocument::new(built_at, a);
        let doc_b = CatalogDocument::new(built_at, b);
        assert_eq!(doc_a, doc_b);

        let order: Vec<String> = doc_a
            .packages
            .iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(order, vec!["bar@1.0.0", "foo@1.2.0", "foo@1.10.0"]);
    }

    #[test]
    fn lookup_helpers() {
        let doc = CatalogDocument::new(
            Utc::now(),
            vec![record("foo", "1.0.0"), record("foo", "2.0.0"), record("bar", "1.0.0")],
        );
        assert!(doc.contains(&PackageIdentity::new("foo", "2.0.0")));
        assert!(!doc.contains(&PackageIdentity::new("foo", "3.0.0")));
        assert_eq!(doc.versions_of("foo").count(), 2);
        assert_eq!(doc.len(), 3);
        assert!(CatalogDocument::empty().is_empty());
    }

    #[test]
    fn serializes_schema_version() {
        let doc = CatalogDocument::new(Utc::now(), vec![record("foo", "1.0.0")]);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["schema_version"], CATALOG_SCHEMA_VERSION);
        let back: CatalogDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
