//! Metadata extraction from npm-style package tarballs.
//!
//! Only the manifest (`<top>/package.json`, normally `package/package.json`)
//! is read. Nothing is written to disk and nothing from the archive is
//! executed. Archives with absolute or `..` paths are rejected outright.

use bytes::Bytes;
use flate2::read::GzDecoder;
use pkghub_schema::{
    DocLink, LinkKind, PackageIdentity, PackageMetadataRecord, PackageName, Sha256Digest, Version,
};
use serde_json::Value;
use std::io::Read;
use std::path::Component;
use thiserror::Error;

/// Largest manifest accepted.
pub const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// Decompression is cut off after this many bytes.
pub const MAX_UNPACKED_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unreadable archive: {0}")]
    Archive(String),

    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),

    #[error("archive has no package.json manifest")]
    MissingManifest,

    #[error("manifest is {0} bytes, larger than allowed")]
    ManifestTooLarge(u64),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("manifest declares {found}, event is for {expected}")]
    IdentityMismatch { expected: String, found: String },

    #[error("extraction task failed: {0}")]
    Internal(String),
}

impl ExtractError {
    /// Whether the failure says nothing about the artifact itself.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

fn archive_err(e: std::io::Error) -> ExtractError {
    ExtractError::Archive(e.to_string())
}

/// Read and parse the manifest from a gzip-compressed tarball.
///
/// # Errors
///
/// Returns [`ExtractError`] for corrupt archives, unsafe entry paths, a
/// missing or oversized manifest, or a manifest that is not a JSON object.
pub fn read_manifest(data: &[u8]) -> Result<Value, ExtractError> {
    let decoder = GzDecoder::new(data).take(MAX_UNPACKED_BYTES);
    let mut archive = tar::Archive::new(decoder);
    let mut manifest = None;

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let path = entry.path().map_err(archive_err)?.into_owned();

        if path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            return Err(ExtractError::UnsafePath(path.display().to_string()));
        }

        if manifest.is_some() || !entry.header().entry_type().is_file() {
            continue;
        }
        let parts: Vec<_> = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        if parts.len() != 2 || parts[1].as_os_str() != "package.json" {
            continue;
        }

        let size = entry.size();
        if size > MAX_MANIFEST_BYTES {
            return Err(ExtractError::ManifestTooLarge(size));
        }
        let mut raw = Vec::with_capacity(size as usize);
        entry.read_to_end(&mut raw).map_err(archive_err)?;
        manifest = Some(raw);
    }

    let raw = manifest.ok_or(ExtractError::MissingManifest)?;
    let value: Value =
        serde_json::from_slice(&raw).map_err(|e| ExtractError::InvalidManifest(e.to_string()))?;
    if !value.is_object() {
        return Err(ExtractError::InvalidManifest("not a JSON object".to_string()));
    }
    Ok(value)
}

/// Derive the metadata record for `identity` from its artifact.
///
/// The result depends only on the artifact bytes, so extracting the same
/// artifact twice yields equal records.
///
/// # Errors
///
/// Everything [`read_manifest`] rejects, plus [`ExtractError::IdentityMismatch`]
/// when the manifest describes a different package.
pub fn extract_record(
    identity: &PackageIdentity,
    digest: &Sha256Digest,
    data: &[u8],
) -> Result<PackageMetadataRecord, ExtractError> {
    let manifest = read_manifest(data)?;

    let (Some(name), Some(version)) = (str_field(&manifest, "name"), str_field(&manifest, "version"))
    else {
        return Err(ExtractError::InvalidManifest(
            "name and version are required".to_string(),
        ));
    };
    let declared = PackageIdentity {
        name: PackageName::new(name),
        version: Version::new(version),
    };
    if &declared != identity {
        return Err(ExtractError::IdentityMismatch {
            expected: identity.to_string(),
            found: declared.to_string(),
        });
    }

    Ok(PackageMetadataRecord {
        identity: identity.clone(),
        description: str_field(&manifest, "description")
            .unwrap_or_default()
            .to_string(),
        license: license(&manifest),
        tags: tags(&manifest),
        links: links(&manifest),
        content_digest: digest.clone(),
    })
}

/// [`extract_record`] on the blocking thread pool.
///
/// # Errors
///
/// As [`extract_record`]; a panicked or cancelled task is
/// [`ExtractError::Internal`].
pub async fn extract_record_blocking(
    identity: PackageIdentity,
    digest: Sha256Digest,
    data: Bytes,
) -> Result<PackageMetadataRecord, ExtractError> {
    tokio::task::spawn_blocking(move || extract_record(&identity, &digest, &data))
        .await
        .map_err(|e| ExtractError::Internal(e.to_string()))?
}

fn str_field<'a>(manifest: &'a Value, key: &str) -> Option<&'a str> {
    manifest
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// "MIT", {"type": "MIT"}, or the legacy "licenses": [{"type": ..}, ..].
fn license(manifest: &Value) -> Option<String> {
    match manifest.get("license") {
        Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
        Some(Value::Object(obj)) => {
            if let Some(kind) = obj.get("type").and_then(Value::as_str) {
                return Some(kind.trim().to_string());
            }
        }
        _ => {}
    }

    let legacy: Vec<&str> = manifest
        .get("licenses")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|l| l.get("type").and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match legacy.len() {
        0 => None,
        1 => Some(legacy[0].to_string()),
        _ => Some(format!("({})", legacy.join(" OR "))),
    }
}

fn tags(manifest: &Value) -> Vec<String> {
    let raw: Vec<&str> = match manifest.get("keywords") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(s)) => s.split([',', ' ']).collect(),
        _ => Vec::new(),
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in raw.into_iter().map(|t| t.trim().to_lowercase()) {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

fn links(manifest: &Value) -> Vec<DocLink> {
    let url_of = |key: &str| -> Option<String> {
        let url = match manifest.get(key)? {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => obj.get("url").and_then(Value::as_str)?,
            _ => return None,
        };
        let url = url.trim();
        let url = url.strip_prefix("git+").unwrap_or(url);
        (!url.is_empty()).then(|| url.to_string())
    };

    [
        (LinkKind::Homepage, "homepage"),
        (LinkKind::Repository, "repository"),
        (LinkKind::Issues, "bugs"),
    ]
    .into_iter()
    .filter_map(|(kind, key)| url_of(key).map(|url| DocLink { kind, url }))
    .collect()
}
