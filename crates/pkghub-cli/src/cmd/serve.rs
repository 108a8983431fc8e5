//! Serve command: feed NDJSON ingestion events through the pipeline

use anyhow::{Context, Result};
use pkghub_core::{Admission, ExecutionOutcome, HubEvent, PackageHub};
use pkghub_schema::IngestionEvent;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::TryRecvError;

#[derive(Debug, Default)]
struct Counts {
    accepted: usize,
    duplicate: usize,
    malformed: usize,
    persisted: usize,
    rejected: usize,
    failed: usize,
}

/// Submit every event from `events` (or stdin) and run until input ends
/// or Ctrl-C, then drain the pipeline.
pub async fn serve(hub: &PackageHub, events: Option<&Path>) -> Result<()> {
    let input: Box<dyn AsyncRead + Unpin + Send> = match events {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(input).lines();
    let mut outcomes = hub.subscribe();
    let mut counts = Counts::default();

    hub.start();
    hub.spawn_inventory();
    hub.spawn_lifecycle();
    tracing::info!("pkghub serving");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read events")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: IngestionEvent = match serde_json::from_str(line) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unparseable event");
                        counts.malformed += 1;
                        continue;
                    }
                };
                match hub.submit(event).await {
                    Ok(Admission::Accepted { .. }) => counts.accepted += 1,
                    Ok(Admission::Duplicate) => counts.duplicate += 1,
                    Err(_) => counts.malformed += 1,
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, draining");
                interrupted = true;
                break;
            }
        }
        tally(&mut outcomes, &mut counts);
    }

    if !interrupted {
        hub.drain().await;
    }
    hub.shutdown().await;
    tally(&mut outcomes, &mut counts);

    let lw = 12;
    println!();
    println!("  {:<lw$}{}", "accepted", counts.accepted);
    println!("  {:<lw$}{}", "duplicate", counts.duplicate);
    println!("  {:<lw$}{}", "malformed", counts.malformed);
    println!("  {:<lw$}{}", "persisted", counts.persisted);
    println!("  {:<lw$}{}", "rejected", counts.rejected);
    println!("  {:<lw$}{}", "failed", counts.failed);
    Ok(())
}

/// Fold already-delivered execution reports into the counters.
fn tally(rx: &mut Receiver<HubEvent>, counts: &mut Counts) {
    loop {
        match rx.try_recv() {
            Ok(HubEvent::ExecutionFinished(report)) => match report.outcome {
                ExecutionOutcome::Persisted { .. } => counts.persisted += 1,
                ExecutionOutcome::Rejected { .. } => counts.rejected += 1,
                ExecutionOutcome::Failed { .. } => counts.failed += 1,
            },
            Ok(_) => {}
            Err(TryRecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "outcome counters lagged");
            }
            Err(_) => break,
        }
    }
}
