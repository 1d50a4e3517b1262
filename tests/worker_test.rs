//! Lease pass behavior: leasing, retirement, rearming, failure handling.

use pullq::config::QueueSettings;
use pullq::engine::{FixedTagChooser, LeaseWorker, Populator, QueueScheduler};
use pullq::error::Error;
use pullq::model::{
    InvocationKind, LeaseParams, NewItem, Payload, RetryPolicy, WorkerInvocation,
};
use pullq::store::TaggedQueueStore;
use pullq::store::memory::MemoryStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<MemoryStore>,
    worker: LeaseWorker,
    populator: Populator,
    settings: QueueSettings,
}

fn harness(pinned_tag: usize) -> Harness {
    let settings = QueueSettings::default();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(QueueScheduler::new(store.clone()));
    let worker = LeaseWorker::new(
        store.clone(),
        scheduler,
        Arc::new(FixedTagChooser(pinned_tag)),
        &settings,
    );
    let populator = Populator::new(store.clone(), settings.jobs_queue.clone());
    Harness {
        store,
        worker,
        populator,
        settings,
    }
}

impl Harness {
    async fn rearmed(&self) -> Vec<WorkerInvocation> {
        self.store
            .peek(&self.settings.worker_queue)
            .await
            .iter()
            .map(|item| WorkerInvocation::from_item(item).unwrap())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Leasing and retirement
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn item_is_retired_on_the_pass_that_leases_it_twice() {
    let h = harness(0);
    h.populator.populate("mytag_0", 50).await.unwrap();
    let params = LeaseParams::default();

    let first = h.worker.run_pass(Some("mytag"), &params, None).await.unwrap();
    assert_eq!(first.tag, "mytag_0");
    assert_eq!(first.leased.len(), 3);
    assert!(first.retired.is_empty());

    // Let the 20s visibility window lapse.
    tokio::time::advance(Duration::from_secs(21)).await;

    let second = h.worker.run_pass(Some("mytag"), &params, None).await.unwrap();
    assert_eq!(second.leased, first.leased, "expired items are leased again");
    assert_eq!(second.retired, second.leased);

    let remaining: HashSet<_> = h
        .store
        .peek("jobs")
        .await
        .into_iter()
        .map(|item| item.id)
        .collect();
    assert_eq!(remaining.len(), 47);
    assert!(first.leased.iter().all(|id| !remaining.contains(id)));

    let third = h.worker.run_pass(Some("mytag"), &params, None).await.unwrap();
    assert_eq!(third.leased.len(), 3);
    assert!(third.leased.iter().all(|id| !first.leased.contains(id)));
}

#[tokio::test(start_paused = true)]
async fn lease_count_only_grows_until_retirement() {
    let h = harness(0);
    h.populator.populate("mytag_0", 1).await.unwrap();
    let params = LeaseParams {
        lease_limit: 3,
        ..LeaseParams::default()
    };

    let mut seen = Vec::new();
    for _ in 0..3 {
        h.worker.run_pass(Some("mytag"), &params, None).await.unwrap();
        if let Some(item) = h.store.peek("jobs").await.first() {
            seen.push(item.lease_count);
        }
        tokio::time::advance(Duration::from_secs(21)).await;
    }
    assert_eq!(seen, vec![1, 2], "third lease hits the limit and deletes it");
    assert!(h.store.peek("jobs").await.is_empty());
}

#[tokio::test]
async fn fewer_visible_items_than_requested_is_fine() {
    let h = harness(2);
    h.populator.populate("mytag_2", 1).await.unwrap();

    let report = h
        .worker
        .run_pass(Some("mytag"), &LeaseParams::default(), None)
        .await
        .unwrap();
    assert_eq!(report.tag, "mytag_2");
    assert_eq!(report.leased.len(), 1);
}

#[tokio::test]
async fn pass_without_prefix_leases_any_tag() {
    let h = harness(0);
    h.populator.populate("alpha", 2).await.unwrap();
    h.populator.populate("beta", 2).await.unwrap();

    let params = LeaseParams {
        max_to_lease: 10,
        ..LeaseParams::default()
    };
    let report = h.worker.run_pass(None, &params, None).await.unwrap();
    assert_eq!(report.tag, "");
    assert_eq!(report.leased.len(), 4);

    assert_eq!(h.worker.tag_filter(Some("")), "");
}

#[tokio::test]
async fn pinned_chooser_selects_the_tag_variant() {
    let h = harness(3);
    assert_eq!(h.worker.tag_filter(Some("jobs")), "jobs_3");
    assert_eq!(h.worker.tag_filter(None), "");
}

// ---------------------------------------------------------------------------
// Rearming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_pass_still_rearms_exactly_once() {
    let h = harness(0);
    let report = h
        .worker
        .run_pass(Some("mytag"), &LeaseParams::default(), None)
        .await
        .unwrap();
    assert!(report.leased.is_empty());
    assert!(report.rearmed.is_some());
    assert_eq!(h.rearmed().await.len(), 1);
}

#[tokio::test]
async fn rearm_carries_prefix_params_and_policy() {
    let h = harness(0);
    let params = LeaseParams {
        max_to_lease: 7,
        lease_period: Duration::from_secs(5),
        lease_limit: 4,
    };
    let policy = RetryPolicy::fixed(Duration::from_millis(250));

    h.worker
        .run_pass(Some("mytag"), &params, Some(policy))
        .await
        .unwrap();

    let rearmed = h.rearmed().await;
    assert_eq!(rearmed.len(), 1);
    assert_eq!(rearmed[0].retry_policy, Some(policy));
    assert_eq!(
        rearmed[0].kind,
        InvocationKind::LeasePass {
            tag_prefix: Some("mytag".to_string()),
            params,
        }
    );
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_failure_ends_the_pass_without_rearming() {
    let h = harness(0);
    h.store.set_unavailable(true);

    let err = h
        .worker
        .run_pass(Some("mytag"), &LeaseParams::default(), None)
        .await
        .unwrap_err();
    assert!(err.is_store_unavailable());

    h.store.set_unavailable(false);
    assert!(h.rearmed().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_delete_is_swallowed_and_retried_on_next_lease() {
    let h = harness(0);
    h.populator.populate("mytag_0", 1).await.unwrap();
    let params = LeaseParams {
        lease_limit: 1,
        ..LeaseParams::default()
    };

    h.store.fail_deletes(true);
    let report = h.worker.run_pass(Some("mytag"), &params, None).await.unwrap();
    assert_eq!(report.delete_failures, 1);
    assert!(report.retired.is_empty());
    assert!(report.rearmed.is_some(), "delete failures do not stop rearming");
    assert_eq!(h.store.peek("jobs").await.len(), 1);

    h.store.fail_deletes(false);
    tokio::time::advance(Duration::from_secs(21)).await;
    let report = h.worker.run_pass(Some("mytag"), &params, None).await.unwrap();
    assert_eq!(report.retired.len(), 1);
    assert!(h.store.peek("jobs").await.is_empty());
}

#[tokio::test]
async fn malformed_payload_aborts_the_pass() {
    let h = harness(0);
    h.store
        .insert_batch(
            "jobs",
            vec![NewItem::raw("mytag_0", "tagname=mytag_0")],
        )
        .await
        .unwrap();
    let params = LeaseParams {
        lease_limit: 1,
        ..LeaseParams::default()
    };

    let err = h
        .worker
        .run_pass(Some("mytag"), &params, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadMalformed(_)));
    assert!(h.rearmed().await.is_empty());
    assert_eq!(
        h.store.peek("jobs").await.len(),
        1,
        "retirement never ran for the aborted batch"
    );
}

#[tokio::test]
async fn tagname_mismatch_is_only_counted() {
    let h = harness(0);
    h.store
        .insert_batch(
            "jobs",
            vec![NewItem::new("mytag_0", &Payload::for_tag("someone_else"))],
        )
        .await
        .unwrap();

    let report = h
        .worker
        .run_pass(Some("mytag"), &LeaseParams::default(), None)
        .await
        .unwrap();
    assert_eq!(report.leased.len(), 1);
    assert_eq!(report.tag_mismatches, 1);
    assert!(report.rearmed.is_some());
}
