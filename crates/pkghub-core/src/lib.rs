pub mod catalog;
pub mod config;
pub mod denylist;
pub mod extract;
pub mod fetch;
pub mod hub;
pub mod ingestion;
pub mod inventory;
pub mod layout;
pub mod lease;
pub mod license;
pub mod orchestration;
pub mod paths;
pub mod queue;
pub mod retry;
pub mod store;

pub mod reporter;

pub use catalog::{CatalogError, RebuildCoordinator, RebuildSummary, load_catalog};
pub use config::HubConfig;
pub use denylist::{DenyList, Verdict};
pub use hub::{DenyUpdate, PackageHub};
pub use ingestion::{Admission, IngestError};
pub use orchestration::{ExecutionOutcome, ExecutionReport, RejectReason};
pub use paths::*;
pub use reporter::{ChannelReporter, HubEvent, NullReporter, Reporter, TracingReporter};
pub use store::{ObjectStore, StoreError};

/// User Agent string for artifact fetches
pub const USER_AGENT: &str = concat!("pkghub-core/", env!("CARGO_PKG_VERSION"));
