//! End-to-end pipeline scenarios over an in-memory store.

mod common;

use common::{memory_hub, names, upload};
use pkghub_core::layout::{CATALOG_KEY, lease_key, metadata_key};
use pkghub_core::store::{ObjectStore, Precondition};
use pkghub_core::{Admission, ExecutionOutcome, ExecutionReport, HubEvent, RejectReason};
use pkghub_schema::{DenyRule, PackageIdentity, Sha256Digest};
use std::time::Duration;
use tokio::sync::broadcast;

async fn finished(rx: &mut broadcast::Receiver<HubEvent>, identity: &PackageIdentity) -> ExecutionReport {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let HubEvent::ExecutionFinished(report) = rx.recv().await.unwrap() {
                if &report.identity == identity {
                    return report;
                }
            }
        }
    })
    .await
    .expect("execution did not finish")
}

#[tokio::test]
async fn scenario_a_valid_package_is_catalogued() {
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;

    assert!(matches!(hub.submit(event).await.unwrap(), Admission::Accepted { .. }));
    hub.drain().await;

    let catalog = hub.catalog().await.unwrap();
    assert_eq!(names(&catalog), ["foo@1.0.0"]);
    let record = &catalog.packages[0];
    assert_eq!(record.description, "The foo package");
    assert_eq!(record.tags, ["test"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn scenario_b_new_deny_rule_removes_catalogued_package() {
    let (hub, store) = memory_hub().await;
    for version in ["1.0.0", "1.1.0"] {
        let event = upload(store.as_ref(), "foo", version, "MIT").await;
        hub.submit(event).await.unwrap();
    }
    let event = upload(store.as_ref(), "bar", "1.0.0", "MIT").await;
    hub.submit(event).await.unwrap();
    hub.drain().await;
    assert_eq!(hub.catalog().await.unwrap().len(), 3);

    let mut events = hub.subscribe();
    let update = hub
        .update_deny_rules(vec![DenyRule::all_versions("foo", "compromised maintainer")])
        .await
        .unwrap();
    let prune = update.prune.unwrap();
    assert_eq!(
        prune.denied,
        [PackageIdentity::new("foo", "1.0.0"), PackageIdentity::new("foo", "1.1.0")]
    );
    assert!(matches!(events.recv().await.unwrap(), HubEvent::Pruned(_)));

    let summary = hub.wait_for_rebuild(update.ticket.unwrap()).await.unwrap();
    assert_eq!(summary.excluded_denied, 2);
    assert_eq!(names(&hub.catalog().await.unwrap()), ["bar@1.0.0"]);

    // Records stay in storage; removing the rule brings them back.
    assert!(store.stat(&metadata_key(&PackageIdentity::new("foo", "1.0.0"))).await.unwrap().is_some());
    let update = hub.update_deny_rules(Vec::new()).await.unwrap();
    hub.wait_for_rebuild(update.ticket.unwrap()).await.unwrap();
    assert_eq!(hub.catalog().await.unwrap().len(), 3);
    hub.shutdown().await;
}

#[tokio::test]
async fn scenario_c_digest_mismatch_is_rejected() {
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    hub.submit(event).await.unwrap();
    hub.drain().await;
    let before = store.get(CATALOG_KEY).await.unwrap();

    let mut event = upload(store.as_ref(), "bar", "2.0.0", "MIT").await;
    event.integrity_digest = Sha256Digest::compute(b"not the artifact").prefixed();
    let mut events = hub.subscribe();
    hub.submit(event.clone()).await.unwrap();

    let report = finished(&mut events, &event.identity).await;
    assert!(matches!(
        report.outcome,
        ExecutionOutcome::Rejected {
            reason: RejectReason::IntegrityMismatch { .. }
        }
    ));
    hub.drain().await;

    assert!(store.stat(&metadata_key(&event.identity)).await.unwrap().is_none());
    let after = store.get(CATALOG_KEY).await.unwrap();
    assert_eq!(after.meta.version, before.meta.version, "no rebuild was triggered");
    hub.shutdown().await;
}

#[tokio::test]
async fn scenario_d_concurrent_duplicates_yield_one_record() {
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "baz", "1.0.0", "MIT").await;
    let mut events = hub.subscribe();

    let (a, b) = tokio::join!(hub.submit(event.clone()), hub.submit(event.clone()));
    let admissions = [a.unwrap(), b.unwrap()];
    assert_eq!(
        admissions.iter().filter(|a| **a == Admission::Duplicate).count(),
        1
    );
    let report = finished(&mut events, &event.identity).await;
    assert_eq!(report.outcome, ExecutionOutcome::Persisted { changed: true });
    hub.drain().await;

    let key = metadata_key(&event.identity);
    assert!(store.stat(&key).await.unwrap().is_some());
    assert_eq!(store.noncurrent_versions(&key), 0, "written exactly once");
    assert_eq!(names(&hub.catalog().await.unwrap()), ["baz@1.0.0"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn duplicate_deliveries_do_not_conflict() {
    // At-least-once delivery: the same event reaches two workers at once.
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "baz", "1.0.0", "MIT").await;
    let mut events = hub.subscribe();

    let queue = hub.ingestion().queue().clone();
    queue.send(&event).unwrap();
    queue.send(&event).unwrap();

    let first = finished(&mut events, &event.identity).await;
    let second = finished(&mut events, &event.identity).await;
    let mut changed: Vec<bool> = [first, second]
        .into_iter()
        .map(|r| match r.outcome {
            ExecutionOutcome::Persisted { changed } => changed,
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    changed.sort_unstable();
    assert_eq!(changed, [false, true]);
    hub.drain().await;

    assert_eq!(store.noncurrent_versions(&metadata_key(&event.identity)), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn resubmission_is_idempotent() {
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    hub.submit(event.clone()).await.unwrap();
    hub.drain().await;
    let status = hub.coordinator().status();

    assert_eq!(hub.submit(event).await.unwrap(), Admission::Duplicate);
    hub.drain().await;
    assert_eq!(hub.coordinator().status(), status, "no further rebuild");
    assert_eq!(hub.catalog().await.unwrap().len(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn new_digest_replaces_record() {
    let (hub, store) = memory_hub().await;
    let first = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    hub.submit(first).await.unwrap();
    hub.drain().await;

    // Republished under the same identity with a different license.
    let second = upload(store.as_ref(), "foo", "1.0.0", "Apache-2.0").await;
    assert!(matches!(hub.submit(second).await.unwrap(), Admission::Accepted { .. }));
    hub.drain().await;

    let catalog = hub.catalog().await.unwrap();
    assert_eq!(catalog.packages[0].license.as_deref(), Some("Apache-2.0"));
    hub.shutdown().await;
}

#[tokio::test]
async fn catalog_is_sorted_regardless_of_arrival_order() {
    let (hub, store) = memory_hub().await;
    for (name, version) in [
        ("zeta", "1.0.0"),
        ("alpha", "10.0.0"),
        ("@scope/pkg", "1.0.0"),
        ("alpha", "2.0.0"),
        ("alpha", "2.0.0-beta.1"),
        ("mid", "0.1.0"),
    ] {
        let event = upload(store.as_ref(), name, version, "MIT").await;
        hub.submit(event).await.unwrap();
    }
    hub.drain().await;

    assert_eq!(
        names(&hub.catalog().await.unwrap()),
        [
            "@scope/pkg@1.0.0",
            "alpha@2.0.0-beta.1",
            "alpha@2.0.0",
            "alpha@10.0.0",
            "mid@0.1.0",
            "zeta@1.0.0"
        ]
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn denied_at_ingestion_is_never_persisted() {
    let mut config = common::fast_config();
    config.deny = vec![DenyRule::exact("evil", "6.6.6", "malware")];
    let (hub, store) = common::memory_hub_with(config).await;

    let event = upload(store.as_ref(), "evil", "6.6.6", "MIT").await;
    let mut events = hub.subscribe();
    hub.submit(event.clone()).await.unwrap();
    let report = finished(&mut events, &event.identity).await;
    assert_eq!(
        report.outcome,
        ExecutionOutcome::Rejected {
            reason: RejectReason::DenyListed {
                reason: "malware".to_string()
            }
        }
    );
    assert!(store.stat(&metadata_key(&event.identity)).await.unwrap().is_none());

    // Other versions are unaffected by an exact rule.
    let ok = upload(store.as_ref(), "evil", "7.0.0", "MIT").await;
    hub.submit(ok).await.unwrap();
    hub.drain().await;
    assert_eq!(names(&hub.catalog().await.unwrap()), ["evil@7.0.0"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn failed_rebuild_keeps_previous_catalog() {
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    hub.submit(event).await.unwrap();
    hub.drain().await;
    let before = hub.catalog().await.unwrap();

    store.set_unavailable(true);
    assert!(hub.rebuild_and_wait().await.is_err());
    store.set_unavailable(false);

    assert_eq!(hub.catalog().await.unwrap(), before);
    hub.rebuild_and_wait().await.unwrap();
    hub.shutdown().await;
}

#[tokio::test]
async fn corrupt_record_does_not_fail_rebuild() {
    let (hub, store) = memory_hub().await;
    let event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    hub.submit(event).await.unwrap();
    hub.drain().await;

    store
        .put(
            &metadata_key(&PackageIdentity::new("broken", "1.0.0")),
            "{\"identity\":".into(),
            Precondition::None,
        )
        .await
        .unwrap();
    let summary = hub.rebuild_and_wait().await.unwrap();
    assert_eq!(summary.skipped_corrupt, 1);
    assert_eq!(names(&hub.catalog().await.unwrap()), ["foo@1.0.0"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn malformed_events_are_rejected_at_the_boundary() {
    let (hub, store) = memory_hub().await;
    let mut event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    event.artifact_location = "gopher://nowhere".to_string();
    assert!(hub.submit(event).await.is_err());
    assert_eq!(hub.ingestion().queue().outstanding(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn lifecycle_loop_expires_old_versions() {
    let mut config = common::fast_config();
    config.lifecycle.noncurrent_days = 0;
    config.lifecycle.catalog_noncurrent_days = 0;
    let (hub, store) = common::memory_hub_with(config).await;

    let event = upload(store.as_ref(), "foo", "1.0.0", "MIT").await;
    hub.submit(event.clone()).await.unwrap();
    hub.drain().await;
    let lease = lease_key(&event.identity);
    assert!(store.noncurrent_versions(&lease) > 0, "lease churn leaves old versions");

    hub.spawn_lifecycle();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.noncurrent_versions(&lease) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old versions were not expired");
    assert_eq!(names(&hub.catalog().await.unwrap()), ["foo@1.0.0"]);
    hub.shutdown().await;
}
