//! Seeding the jobs backlog: one populator run per tag, fanned out through
//! the populator control queue.

use crate::config::QueueSettings;
use crate::engine::scheduler::Scheduler;
use crate::error::Result;
use crate::model::{ItemId, NewItem, Payload, WorkerInvocation};
use crate::store::{TaggedQueueStore, check_batch};
use std::sync::Arc;
use tracing::{debug, info};

/// Concrete tag number `i` for a prefix, e.g. `mytag_2`.
pub fn tag_variant(prefix: &str, i: usize) -> String {
    format!("{prefix}_{i}")
}

/// Inserts a batch of identically tagged items into the jobs backlog.
#[derive(Clone)]
pub struct Populator {
    store: Arc<dyn TaggedQueueStore>,
    jobs_queue: String,
}

impl Populator {
    pub fn new(store: Arc<dyn TaggedQueueStore>, jobs_queue: impl Into<String>) -> Self {
        Self {
            store,
            jobs_queue: jobs_queue.into(),
        }
    }

    /// Insert `count` items tagged `tag`, each with `tagname = tag` in its payload.
    ///
    /// An empty tag is a no-op. Store failures are returned as-is; the
    /// control queue retries the whole run.
    pub async fn populate(&self, tag: &str, count: usize) -> Result<Vec<ItemId>> {
        if tag.is_empty() {
            debug!("populate called without a tag, nothing to do");
            return Ok(Vec::new());
        }
        check_batch(count)?;

        info!(tag, count, queue = %self.jobs_queue, "populating jobs queue");
        let payload = Payload::for_tag(tag);
        let items = (0..count).map(|_| NewItem::new(tag, &payload)).collect();
        self.store.insert_batch(&self.jobs_queue, items).await
    }
}

/// Schedules one populator run per tag variant of a prefix.
#[derive(Clone)]
pub struct TagFanout {
    scheduler: Arc<dyn Scheduler>,
    populator_queue: String,
    default_prefix: String,
    items_per_tag: usize,
}

impl TagFanout {
    pub fn new(scheduler: Arc<dyn Scheduler>, settings: &QueueSettings) -> Self {
        Self {
            scheduler,
            populator_queue: settings.populator_queue.clone(),
            default_prefix: settings.default_tag_prefix.clone(),
            items_per_tag: settings.populate_count,
        }
    }

    /// Schedule `num_tags` populate invocations for `{prefix}_0 .. {prefix}_{n-1}`.
    /// An empty prefix falls back to the configured default. Returns the tags.
    pub async fn fan_out(&self, tag_prefix: &str, num_tags: usize) -> Result<Vec<String>> {
        let prefix = if tag_prefix.is_empty() {
            self.default_prefix.as_str()
        } else {
            tag_prefix
        };

        let tags: Vec<String> = (0..num_tags).map(|i| tag_variant(prefix, i)).collect();
        let invocations = tags
            .iter()
            .map(|tag| WorkerInvocation::populate(tag.clone(), self.items_per_tag))
            .collect();
        self.scheduler
            .schedule(&self.populator_queue, invocations)
            .await?;

        info!(prefix, num_tags, "populator invocations scheduled");
        Ok(tags)
    }
}
