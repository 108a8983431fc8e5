//! Shared types and wire format for pkghub.
//!
//! Everything that crosses a boundary (queue message bodies, objects in the
//! package store, the served catalog document) is defined here so producers
//! and consumers agree on a single shape.

/// Served catalog document.
pub mod catalog;
/// Deny-list rules.
pub mod deny;
/// Ingestion events.
pub mod event;
/// SHA-256 digests.
pub mod hash;
/// Package metadata records.
pub mod record;
/// Core identity types.
pub mod types;

// Re-exports
pub use catalog::{CATALOG_SCHEMA_VERSION, CatalogDocument};
pub use deny::{DenyRule, WILDCARD_VERSION};
pub use event::{ArtifactLocation, EventError, IngestionEvent};
pub use hash::{DigestError, Sha256Digest};
pub use record::{DocLink, LinkKind, PackageMetadataRecord};
pub use types::{IdentityError, PackageIdentity, PackageName, Version};
