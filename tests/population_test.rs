//! Worker population control and backlog seeding.

use pullq::config::QueueSettings;
use pullq::engine::{Populator, QueueScheduler, TagFanout, WorkerPopulation, purge_and_settle};
use pullq::error::Error;
use pullq::model::{InvocationKind, RetryPolicy, WorkerInvocation};
use pullq::store::memory::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MemoryStore>, Arc<QueueScheduler>, QueueSettings) {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(QueueScheduler::new(store.clone()));
    (store, scheduler, QueueSettings::default())
}

async fn pending(store: &MemoryStore, queue: &str) -> Vec<WorkerInvocation> {
    store
        .peek(queue)
        .await
        .iter()
        .map(|item| WorkerInvocation::from_item(item).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Start / purge
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_clamps_to_batch_cap() {
    let (store, scheduler, settings) = setup();
    let population = WorkerPopulation::new(scheduler, &settings);

    let ids = population.start(None, 150).await.unwrap();
    assert_eq!(ids.len(), 100);

    let workers = pending(&store, "worker").await;
    assert_eq!(workers.len(), 100);
    for inv in &workers {
        assert_eq!(inv.retry_policy, Some(RetryPolicy::fixed(Duration::from_millis(500))));
        assert!(matches!(inv.kind, InvocationKind::LeasePass { tag_prefix: None, .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn start_with_zero_workers_starts_one() {
    let (store, scheduler, settings) = setup();
    WorkerPopulation::new(scheduler, &settings)
        .start(Some("mytag"), 0)
        .await
        .unwrap();
    assert_eq!(pending(&store, "worker").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_replaces_rather_than_adds() {
    let (store, scheduler, settings) = setup();
    let population = WorkerPopulation::new(scheduler, &settings);

    population.start(Some("mytag"), 5).await.unwrap();
    population.start(Some("other"), 3).await.unwrap();

    let workers = pending(&store, "worker").await;
    assert_eq!(workers.len(), 3);
    assert!(workers.iter().all(|inv| matches!(
        &inv.kind,
        InvocationKind::LeasePass { tag_prefix: Some(p), .. } if p == "other"
    )));
}

#[tokio::test(start_paused = true)]
async fn start_waits_for_the_settle_delay() {
    let (_store, scheduler, settings) = setup();
    let population = WorkerPopulation::new(scheduler, &settings);

    let before = tokio::time::Instant::now();
    population.start(None, 2).await.unwrap();
    assert!(before.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn purge_clears_pending_workers() {
    let (store, scheduler, settings) = setup();
    let population = WorkerPopulation::new(scheduler, &settings);
    population.start(Some("mytag"), 4).await.unwrap();

    population.purge().await.unwrap();
    assert!(pending(&store, "worker").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn purge_failure_is_surfaced() {
    let (store, scheduler, settings) = setup();
    store.set_unavailable(true);
    let err = purge_and_settle(scheduler.as_ref(), &settings.worker_queue, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(err.is_store_unavailable());
}

// ---------------------------------------------------------------------------
// Populator / fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn populate_tags_items_and_payloads() {
    let (store, _, settings) = setup();
    let populator = Populator::new(store.clone(), settings.jobs_queue.clone());

    let ids = populator.populate("mytag_1", 50).await.unwrap();
    assert_eq!(ids.len(), 50);

    let items = store.peek("jobs").await;
    assert_eq!(items.len(), 50);
    for item in &items {
        assert_eq!(item.tag, "mytag_1");
        assert_eq!(item.decode_payload().unwrap().tagname(), Some("mytag_1"));
    }
}

#[tokio::test]
async fn populate_without_tag_is_a_no_op() {
    let (store, _, settings) = setup();
    let populator = Populator::new(store.clone(), settings.jobs_queue.clone());
    assert!(populator.populate("", 50).await.unwrap().is_empty());
    assert!(store.peek("jobs").await.is_empty());
}

#[tokio::test]
async fn populate_over_the_cap_never_reaches_the_store() {
    let (store, _, settings) = setup();
    let populator = Populator::new(store.clone(), settings.jobs_queue.clone());
    let err = populator.populate("t", 101).await.unwrap_err();
    assert!(matches!(err, Error::BatchTooLarge { .. }));
    assert!(err.is_permanent());
    assert!(store.peek("jobs").await.is_empty());
}

#[tokio::test]
async fn populate_surfaces_store_errors() {
    let (store, _, settings) = setup();
    let populator = Populator::new(store.clone(), settings.jobs_queue.clone());
    store.set_unavailable(true);
    assert!(populator.populate("t", 5).await.unwrap_err().is_store_unavailable());
}

#[tokio::test]
async fn fan_out_schedules_one_populate_per_tag() {
    let (store, scheduler, settings) = setup();
    let fanout = TagFanout::new(scheduler, &settings);

    let tags = fanout.fan_out("batch", 4).await.unwrap();
    assert_eq!(tags, ["batch_0", "batch_1", "batch_2", "batch_3"]);

    let scheduled = pending(&store, "populator").await;
    let expected: Vec<_> = tags
        .iter()
        .map(|tag| InvocationKind::Populate {
            tag: tag.clone(),
            count: 50,
        })
        .collect();
    let kinds: Vec<_> = scheduled.into_iter().map(|inv| inv.kind).collect();
    assert_eq!(kinds, expected);
    assert!(store.peek("jobs").await.is_empty(), "population is deferred");
}

#[tokio::test]
async fn fan_out_defaults_the_prefix() {
    let (_, scheduler, settings) = setup();
    let tags = TagFanout::new(scheduler, &settings)
        .fan_out("", 2)
        .await
        .unwrap();
    assert_eq!(tags, ["mytag_0", "mytag_1"]);
}
