//! Hub configuration.
//!
//! Loaded from `~/.pkghub/config.toml` (or `--config`), then overridden from
//! `PKGHUB_*` environment variables. Every field has a default, so an absent
//! file is a valid configuration.
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "pkghub-packages"
//! endpoint = "https://<account>.r2.cloudflarestorage.com"
//!
//! [orchestration]
//! concurrency = 16
//!
//! [fetch]
//! granted_hosts = ["registry.npmjs.org"]
//!
//! [[deny]]
//! package = "left-pad"
//! reason = "withdrawn by author"
//! ```

use pkghub_schema::DenyRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::store::LifecyclePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Fs,
    S3,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "fs" => Ok(Self::Fs),
            "s3" => Ok(Self::S3),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            bucket: None,
            endpoint: None,
            region: "auto".to_string(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the `fs` backend.
    pub root: PathBuf,
    #[serde(flatten)]
    pub s3: S3Settings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: crate::paths::storage_root(),
            s3: S3Settings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Attempts per event before it ends in `Failed`.
    pub max_attempts: u32,
    /// Hard timeout of one execution attempt.
    pub timeout_secs: u64,
    /// Global ceiling on concurrent executions.
    pub concurrency: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-identity lease lifetime. Must outlive `timeout_secs`.
    pub lease_ttl_secs: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_secs: 900,
            concurrency: 8,
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
            lease_ttl_secs: 960,
        }
    }
}

impl OrchestrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Metadata objects read concurrently during a rebuild.
    pub read_concurrency: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            read_concurrency: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Hosts artifact URLs may point at. Empty means no HTTP fetching.
    pub granted_hosts: Vec<String>,
    pub timeout_secs: u64,
    pub max_artifact_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            granted_hosts: Vec::new(),
            timeout_secs: 60,
            max_artifact_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Allowed SPDX identifiers.
    pub allowed: Vec<String>,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            allowed: crate::license::DEFAULT_LICENSES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Upper bound for lifecycle retention (about a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub noncurrent_days: i64,
    pub catalog_noncurrent_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            noncurrent_days: 90,
            catalog_noncurrent_days: 7,
        }
    }
}

impl LifecycleConfig {
    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy::new(self.noncurrent_days, self.catalog_noncurrent_days)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub interval_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self { interval_secs: 900 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub storage: StorageConfig,
    pub orchestration: OrchestrationConfig,
    pub catalog: CatalogConfig,
    pub fetch: FetchConfig,
    pub licenses: LicenseConfig,
    /// Initial deny rules, used until a persisted deny list exists.
    pub deny: Vec<DenyRule>,
    pub lifecycle: LifecycleConfig,
    pub inventory: InventoryConfig,
}

impl HubConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file exists but cannot be read and
    /// [`ConfigError::Parse`] if it is not valid TOML for this schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `PKGHUB_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for unparseable values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Setting `PKGHUB_S3_BUCKET` switches the backend to `s3`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for unparseable values.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("PKGHUB_STORAGE_BACKEND") {
            self.storage.backend = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "PKGHUB_STORAGE_BACKEND",
                value,
            })?;
        }
        if let Some(root) = lookup("PKGHUB_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(bucket) = lookup("PKGHUB_S3_BUCKET") {
            self.storage.backend = StorageBackend::S3;
            self.storage.s3.bucket = Some(bucket);
        }
        if let Some(endpoint) = lookup("PKGHUB_S3_ENDPOINT") {
            self.storage.s3.endpoint = Some(endpoint);
        }
        if let Some(key) = lookup("PKGHUB_S3_ACCESS_KEY") {
            self.storage.s3.access_key_id = Some(key);
        }
        if let Some(secret) = lookup("PKGHUB_S3_SECRET_KEY") {
            self.storage.s3.secret_access_key = Some(secret);
        }
        if let Some(value) = lookup("PKGHUB_CONCURRENCY") {
            self.orchestration.concurrency =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "PKGHUB_CONCURRENCY",
                    value,
                })?;
        }
        Ok(())
    }

    /// Check the configuration for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let orch = &self.orchestration;

        if orch.concurrency == 0 {
            return invalid("orchestration.concurrency must be at least 1");
        }
        if orch.max_attempts == 0 || self.catalog.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if orch.timeout_secs == 0 {
            return invalid("orchestration.timeout_secs must be at least 1");
        }
        if orch.lease_ttl_secs <= orch.timeout_secs {
            return invalid("orchestration.lease_ttl_secs must exceed timeout_secs");
        }
        if self.catalog.read_concurrency == 0 {
            return invalid("catalog.read_concurrency must be at least 1");
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.s3.bucket.is_none() {
            return invalid("storage.bucket is required for the s3 backend");
        }
        for days in [self.lifecycle.noncurrent_days, self.lifecycle.catalog_noncurrent_days] {
            if !(0..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(ConfigError::Invalid(format!(
                    "lifecycle retention must be between 0 and {MAX_RETENTION_DAYS} days, got {days}"
                )));
            }
        }
        if self.inventory.interval_secs == 0 {
            return invalid("inventory.interval_secs must be at least 1");
        }
        for rule in &self.deny {
            if rule.package.validate().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "deny rule for invalid package name '{}'",
                    rule.package
                )));
            }
        }
        Ok(())
    }
}
