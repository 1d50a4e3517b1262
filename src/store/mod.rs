//! The tagged queue interface consumed by the engine.
//!
//! Every operation is atomic in the backing service; the engine never holds
//! a lock of its own. Two implementations ship: [`crate::db::Db`] on pgmq and
//! [`memory::MemoryStore`] in process.

pub mod memory;

use crate::error::{Error, Result};
use crate::model::{ItemId, NewItem, WorkItem};
use async_trait::async_trait;
use std::time::Duration;

pub use crate::config::settings::MAX_BATCH_SIZE;

/// Snapshot of a queue's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items present, leased or not.
    pub total: u64,
    /// Items currently hidden by an unexpired lease.
    pub leased: u64,
}

#[async_trait]
pub trait TaggedQueueStore: Send + Sync {
    /// Insert up to [`MAX_BATCH_SIZE`] items. Returns the assigned ids in input order.
    async fn insert_batch(&self, queue: &str, items: Vec<NewItem>) -> Result<Vec<ItemId>>;

    /// Lease up to `max_items` visible items whose tag equals `tag`
    /// (any tag when `tag` is empty). Each returned item has its lease count
    /// incremented and stays hidden for `visibility`.
    async fn lease_by_tag(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        tag: &str,
    ) -> Result<Vec<WorkItem>>;

    /// Delete an item. Unknown or already deleted ids yield [`Error::DeleteFailed`].
    async fn delete(&self, queue: &str, id: ItemId) -> Result<()>;

    /// Discard every pending item. Visibility everywhere may lag; see
    /// [`crate::engine::population::purge_and_settle`].
    async fn purge(&self, queue: &str) -> Result<()>;

    /// Hide an item for `delay` from now, replacing its current lease expiry.
    async fn set_visibility(&self, queue: &str, id: ItemId, delay: Duration) -> Result<()>;

    async fn stats(&self, queue: &str) -> Result<QueueStats>;
}

/// Caller-side guard for the batch insert cap.
pub fn check_batch(len: usize) -> Result<()> {
    if len > MAX_BATCH_SIZE {
        return Err(Error::BatchTooLarge {
            len,
            cap: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Queue names become part of table names, so keep them to `[a-z0-9_]`.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    let valid = !queue.is_empty()
        && queue.len() <= 47
        && queue
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidQueueName(queue.to_string()))
    }
}
