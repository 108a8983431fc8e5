//! Submit command: ingest one local tarball

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use pkghub_core::extract::read_manifest;
use pkghub_core::layout::artifact_key;
use pkghub_core::store::Precondition;
use pkghub_core::{Admission, ExecutionOutcome, ExecutionReport, HubEvent, PackageHub};
use pkghub_schema::{IngestionEvent, PackageIdentity, Sha256Digest};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;

/// Upload `tarball` into the artifact area and run it through the pipeline.
pub async fn submit(
    hub: &PackageHub,
    tarball: &Path,
    name: Option<&str>,
    version: Option<&str>,
) -> Result<()> {
    let data = tokio::fs::read(tarball)
        .await
        .with_context(|| format!("Failed to read {}", tarball.display()))?;
    let identity = resolve_identity(&data, name, version)?;
    identity.validate()?;

    let key = artifact_key(&identity);
    hub.store()
        .put(&key, Bytes::from(data.clone()), Precondition::None)
        .await
        .with_context(|| format!("Failed to upload artifact for {identity}"))?;
    let event = IngestionEvent::new(
        identity.clone(),
        format!("store:{key}"),
        Sha256Digest::compute(&data).prefixed(),
    );

    let mut events = hub.subscribe();
    hub.start();
    match hub.submit(event).await? {
        Admission::Duplicate => {
            println!("  {identity} is already indexed");
            hub.shutdown().await;
            return Ok(());
        }
        Admission::Accepted { message_id } => {
            tracing::debug!(message_id, package = %identity, "submitted");
        }
    }

    let timeout = hub.config().orchestration.timeout()
        * hub.config().orchestration.max_attempts.max(1)
        + Duration::from_secs(60);
    let report = tokio::time::timeout(timeout, wait_finished(&mut events, &identity))
        .await
        .context("Timed out waiting for the pipeline")??;
    hub.drain().await;
    hub.shutdown().await;

    match report.outcome {
        ExecutionOutcome::Persisted { changed: true } => {
            println!("  {identity} indexed ({} attempt(s))", report.attempts);
        }
        ExecutionOutcome::Persisted { changed: false } => {
            println!("  {identity} unchanged");
        }
        ExecutionOutcome::Rejected { reason } => bail!("{identity} rejected: {reason}"),
        ExecutionOutcome::Failed { reason } => {
            bail!("{identity} failed after {} attempt(s): {reason}", report.attempts)
        }
    }
    Ok(())
}

fn resolve_identity(
    data: &[u8],
    name: Option<&str>,
    version: Option<&str>,
) -> Result<PackageIdentity> {
    if let (Some(name), Some(version)) = (name, version) {
        return Ok(PackageIdentity::new(name, version));
    }
    let manifest = read_manifest(data).context("Failed to read package.json from tarball")?;
    let field = |key: &str| manifest.get(key).and_then(|v| v.as_str()).map(str::to_string);

    let Some(name) = name.map(str::to_string).or_else(|| field("name")) else {
        bail!("No package name given and package.json has none");
    };
    let Some(version) = version.map(str::to_string).or_else(|| field("version")) else {
        bail!("No version given and package.json has none");
    };
    Ok(PackageIdentity::new(name, version))
}

async fn wait_finished(
    rx: &mut Receiver<HubEvent>,
    identity: &PackageIdentity,
) -> Result<ExecutionReport> {
    loop {
        match rx.recv().await {
            Ok(HubEvent::ExecutionFinished(report)) if &report.identity == identity => {
                return Ok(report);
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("Pipeline stopped before {identity} finished"),
        }
    }
}
