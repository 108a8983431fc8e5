//! Catalog aggregation: the single served document of all allowed packages.

pub mod builder;
pub mod coordinator;

pub use builder::{CatalogBuilder, CatalogError, RebuildSummary};
pub use coordinator::{CoordinatorState, RebuildCoordinator, RebuildStatus};

use pkghub_schema::CatalogDocument;

use crate::layout::CATALOG_KEY;
use crate::store::{ObjectStore, StoreError, read_json};

/// The currently published catalog, or an empty one before the first
/// successful rebuild.
///
/// # Errors
///
/// Propagates storage errors, including a corrupt document.
pub async fn load_catalog(store: &dyn ObjectStore) -> Result<CatalogDocument, StoreError> {
    Ok(read_json::<CatalogDocument>(store, CATALOG_KEY)
        .await?
        .map_or_else(CatalogDocument::empty, |(doc, _)| doc))
}
