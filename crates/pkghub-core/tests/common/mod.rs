#![allow(dead_code)]

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use pkghub_core::config::HubConfig;
use pkghub_core::layout::artifact_key;
use pkghub_core::store::{MemoryStore, ObjectStore, Precondition};
use pkghub_core::PackageHub;
use pkghub_schema::{IngestionEvent, PackageIdentity, Sha256Digest};
use std::sync::Arc;

/// An npm-layout tarball with just a manifest.
pub fn tarball(name: &str, version: &str, license: &str) -> Vec<u8> {
    let manifest = serde_json::json!({
        "name": name,
        "version": version,
        "description": format!("The {name} package"),
        "license": license,
        "keywords": ["test"],
        "homepage": format!("https://example.com/{name}"),
    })
    .to_string();

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "package/package.json", manifest.as_bytes())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// Upload a tarball into the artifact area and build the event for it.
pub async fn upload(store: &dyn ObjectStore, name: &str, version: &str, license: &str) -> IngestionEvent {
    let identity = PackageIdentity::new(name, version);
    let data = tarball(name, version, license);
    let key = artifact_key(&identity);
    store
        .put(&key, Bytes::from(data.clone()), Precondition::None)
        .await
        .unwrap();
    IngestionEvent::new(identity, format!("store:{key}"), Sha256Digest::compute(&data).prefixed())
}

/// Defaults with short backoffs so retries do not slow tests down.
pub fn fast_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.orchestration.backoff_base_ms = 5;
    config.orchestration.backoff_max_ms = 20;
    config.orchestration.timeout_secs = 10;
    config.orchestration.lease_ttl_secs = 20;
    config.catalog.backoff_base_ms = 5;
    config.catalog.backoff_max_ms = 20;
    config.catalog.max_attempts = 3;
    config
}

pub async fn memory_hub() -> (PackageHub, Arc<MemoryStore>) {
    memory_hub_with(fast_config()).await
}

pub async fn memory_hub_with(config: HubConfig) -> (PackageHub, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let hub = PackageHub::new(config, Arc::clone(&store) as Arc<dyn ObjectStore>)
        .await
        .unwrap();
    hub.start();
    (hub, store)
}

pub fn names(catalog: &pkghub_schema::CatalogDocument) -> Vec<String> {
    catalog.packages.iter().map(|r| r.identity.to_string()).collect()
}
