//! In-process tagged queue.
//!
//! All queues live behind one async mutex, which makes every operation
//! atomic the same way the real service is. Time comes from
//! `tokio::time::Instant`, so tests running on a paused runtime can step
//! over visibility windows and settle delays.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{QueueStats, TaggedQueueStore, check_batch, validate_queue_name};
use crate::error::{Error, Result};
use crate::model::{DeliveryMethod, ItemId, NewItem, WorkItem};

/// Items enqueued this soon after a purge may still be swept by it.
pub const PURGE_RESOLUTION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct StoredItem {
    tag: String,
    payload: String,
    lease_count: u32,
    visible_at: Instant,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    items: BTreeMap<i64, StoredItem>,
    purge_horizon: Option<Instant>,
}

impl QueueState {
    /// Drop items that landed inside the last purge's resolution window.
    fn sweep_purged(&mut self) {
        if let Some(horizon) = self.purge_horizon {
            self.items.retain(|_, item| item.enqueued_at >= horizon);
        }
    }
}

/// Tagged queue held in memory. Also serves as the test double: failures
/// can be injected with [`MemoryStore::set_unavailable`] and
/// [`MemoryStore::fail_deletes`].
#[derive(Debug)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueState>>,
    epoch: Instant,
    epoch_utc: DateTime<Utc>,
    unavailable: AtomicBool,
    failing_deletes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            epoch_utc: Utc::now(),
            unavailable: AtomicBool::new(false),
            failing_deletes: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every delete fail with [`Error::DeleteFailed`].
    pub fn fail_deletes(&self, failing: bool) {
        self.failing_deletes.store(failing, Ordering::SeqCst);
    }

    /// All items in a queue, leased or not, without touching their leases.
    pub async fn peek(&self, queue: &str) -> Vec<WorkItem> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Vec::new();
        };
        state.sweep_purged();
        state
            .items
            .iter()
            .map(|(id, item)| self.to_work_item(*id, item))
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn to_utc(&self, at: Instant) -> DateTime<Utc> {
        let offset = TimeDelta::from_std(at.saturating_duration_since(self.epoch))
            .unwrap_or(TimeDelta::zero());
        self.epoch_utc + offset
    }

    fn to_work_item(&self, id: i64, item: &StoredItem) -> WorkItem {
        WorkItem {
            id: ItemId(id),
            tag: item.tag.clone(),
            method: DeliveryMethod::LeaseOnly,
            payload: item.payload.clone(),
            lease_count: item.lease_count,
            lease_expiry: self.to_utc(item.visible_at),
            enqueued_at: self.to_utc(item.enqueued_at),
        }
    }
}

#[async_trait]
impl TaggedQueueStore for MemoryStore {
    async fn insert_batch(&self, queue: &str, items: Vec<NewItem>) -> Result<Vec<ItemId>> {
        validate_queue_name(queue)?;
        check_batch(items.len())?;
        self.check_available()?;

        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        let mut ids = Vec::with_capacity(items.len());
        for new in items {
            state.next_id += 1;
            state.items.insert(
                state.next_id,
                StoredItem {
                    tag: new.tag,
                    payload: new.payload,
                    lease_count: 0,
                    visible_at: now,
                    enqueued_at: now,
                },
            );
            ids.push(ItemId(state.next_id));
        }
        Ok(ids)
    }

    async fn lease_by_tag(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        tag: &str,
    ) -> Result<Vec<WorkItem>> {
        validate_queue_name(queue)?;
        self.check_available()?;

        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        state.sweep_purged();

        let mut leased = Vec::new();
        for (id, item) in state.items.iter_mut() {
            if leased.len() >= max_items {
                break;
            }
            if now < item.visible_at || (!tag.is_empty() && item.tag != tag) {
                continue;
            }
            item.lease_count += 1;
            item.visible_at = now + visibility;
            leased.push((*id, item.clone()));
        }

        Ok(leased
            .iter()
            .map(|(id, item)| self.to_work_item(*id, item))
            .collect())
    }

    async fn delete(&self, queue: &str, id: ItemId) -> Result<()> {
        validate_queue_name(queue)?;
        self.check_available()?;

        let delete_failed = || Error::DeleteFailed {
            queue: queue.to_string(),
            id: id.0,
        };
        if self.failing_deletes.load(Ordering::SeqCst) {
            return Err(delete_failed());
        }

        let mut queues = self.queues.lock().await;
        queues
            .get_mut(queue)
            .and_then(|state| state.items.remove(&id.0))
            .map(|_| ())
            .ok_or_else(delete_failed)
    }

    async fn purge(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        self.check_available()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.items.clear();
        state.purge_horizon = Some(Instant::now() + PURGE_RESOLUTION);
        Ok(())
    }

    async fn set_visibility(&self, queue: &str, id: ItemId, delay: Duration) -> Result<()> {
        validate_queue_name(queue)?;
        self.check_available()?;

        let mut queues = self.queues.lock().await;
        let item = queues
            .get_mut(queue)
            .and_then(|state| state.items.get_mut(&id.0))
            .ok_or_else(|| Error::NotFound(format!("item {id} in queue {queue}")))?;
        item.visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        validate_queue_name(queue)?;
        self.check_available()?;

        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(QueueStats::default());
        };
        state.sweep_purged();
        Ok(QueueStats {
            total: state.items.len() as u64,
            leased: state.items.values().filter(|i| now < i.visible_at).count() as u64,
        })
    }
}
