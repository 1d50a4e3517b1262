//! The scheduling port: how units of work ask for future units of work.

use crate::error::Result;
use crate::model::{ItemId, WorkerInvocation};
use crate::store::{MAX_BATCH_SIZE, TaggedQueueStore};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;

/// Enqueues future populator and lease-pass executions on a control queue.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedule invocations on `queue`. Any number may be passed; batches are
    /// split to respect the insert cap.
    async fn schedule(&self, queue: &str, invocations: Vec<WorkerInvocation>)
    -> Result<Vec<ItemId>>;

    /// Discard every pending invocation on `queue`. Running ones are unaffected.
    async fn purge(&self, queue: &str) -> Result<()>;
}

/// Scheduler that keeps invocations as items in a tagged queue store, where
/// the dispatcher leases them back out.
#[derive(Clone)]
pub struct QueueScheduler {
    store: Arc<dyn TaggedQueueStore>,
}

impl QueueScheduler {
    pub fn new(store: Arc<dyn TaggedQueueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    async fn schedule(
        &self,
        queue: &str,
        invocations: Vec<WorkerInvocation>,
    ) -> Result<Vec<ItemId>> {
        let mut ids = Vec::with_capacity(invocations.len());
        for chunk in invocations.chunks(MAX_BATCH_SIZE) {
            let items = chunk.iter().map(WorkerInvocation::to_new_item).collect();
            ids.extend(self.store.insert_batch(queue, items).await?);
            for inv in chunk {
                metrics::invocations_scheduled().add(
                    1,
                    &[
                        KeyValue::new("queue", queue.to_string()),
                        KeyValue::new("kind", inv.label()),
                    ],
                );
            }
        }
        Ok(ids)
    }

    async fn purge(&self, queue: &str) -> Result<()> {
        self.store.purge(queue).await
    }
}
