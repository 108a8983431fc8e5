//! Object keys used in the package store.
//!
//! ```text
//! catalog.json
//! deny-list.json
//! inventory.json
//! data/<name>/v<version>/metadata.json
//! leases/<name>/v<version>.json
//! artifacts/<name>/v<version>/package.tgz
//! ```
//!
//! Scoped names keep their `@scope/` segment, so `@aws-cdk/core@1.0.0`
//! lives under `data/@aws-cdk/core/v1.0.0/metadata.json`.

use pkghub_schema::{PackageIdentity, PackageName, Version};

pub const STORAGE_KEY_PREFIX: &str = "data/";
pub const METADATA_KEY_SUFFIX: &str = "/metadata.json";
pub const CATALOG_KEY: &str = "catalog.json";
pub const DENY_LIST_KEY: &str = "deny-list.json";
pub const INVENTORY_KEY: &str = "inventory.json";
pub const LEASE_PREFIX: &str = "leases/";
pub const ARTIFACT_PREFIX: &str = "artifacts/";

pub fn metadata_key(identity: &PackageIdentity) -> String {
    format!(
        "{STORAGE_KEY_PREFIX}{}/v{}{METADATA_KEY_SUFFIX}",
        identity.name, identity.version
    )
}

pub fn lease_key(identity: &PackageIdentity) -> String {
    format!("{LEASE_PREFIX}{}/v{}.json", identity.name, identity.version)
}

pub fn artifact_key(identity: &PackageIdentity) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}/v{}/package.tgz",
        identity.name, identity.version
    )
}

/// Parse a metadata key back into the identity it was derived from.
///
/// Returns `None` for keys outside the metadata layout or with an invalid
/// name or version.
pub fn identity_from_metadata_key(key: &str) -> Option<PackageIdentity> {
    let path = key
        .strip_prefix(STORAGE_KEY_PREFIX)?
        .strip_suffix(METADATA_KEY_SUFFIX)?;
    let (name, version) = path.rsplit_once("/v")?;

    let identity = PackageIdentity {
        name: PackageName::new(name),
        version: Version::new(version),
    };
    // Reject keys that would not round-trip, e.g. uppercase or padded segments.
    if identity.validate().is_err() || metadata_key(&identity) != key {
        return None;
    }
    Some(identity)
}
