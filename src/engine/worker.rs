//! One lease pass: lease a few items, inspect them, retire the ones that
//! hit the lease limit, and rearm.
//!
//! A pass is a discrete unit of execution. It holds no state between runs;
//! continuity comes from the single follow-up invocation it schedules for
//! itself in the Rearming state.

use crate::config::QueueSettings;
use crate::engine::populate::tag_variant;
use crate::engine::scheduler::Scheduler;
use crate::error::Result;
use crate::model::{ItemId, LeaseParams, RetryPolicy, WorkItem, WorkerInvocation};
use crate::store::TaggedQueueStore;
use crate::telemetry::lease::{record_state_transition, record_tag, start_pass_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, Span, debug, info, warn};
use uuid::Uuid;

/// Picks which of `variants` tags a pass filters on.
pub trait TagChooser: Send + Sync {
    /// Returns an index in `0..variants`. `variants` is never zero.
    fn choose(&self, variants: usize) -> usize;
}

/// Uniformly random choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTagChooser;

impl TagChooser for RandomTagChooser {
    fn choose(&self, variants: usize) -> usize {
        rand::thread_rng().gen_range(0..variants)
    }
}

/// Always the same variant (modulo the count). For tests and pinned workers.
#[derive(Debug, Clone, Copy)]
pub struct FixedTagChooser(pub usize);

impl TagChooser for FixedTagChooser {
    fn choose(&self, variants: usize) -> usize {
        self.0 % variants
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Leasing,
    Inspecting,
    Retiring,
    Rearming,
    Done,
}

impl PassState {
    pub fn as_str(self) -> &'static str {
        match self {
            PassState::Leasing => "leasing",
            PassState::Inspecting => "inspecting",
            PassState::Retiring => "retiring",
            PassState::Rearming => "rearming",
            PassState::Done => "done",
        }
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Tag filter used; empty means any tag.
    pub tag: String,
    pub leased: Vec<ItemId>,
    pub retired: Vec<ItemId>,
    pub delete_failures: usize,
    /// Items whose payload `tagname` disagreed with their tag.
    pub tag_mismatches: usize,
    /// The follow-up invocation scheduled for this worker.
    pub rearmed: Option<ItemId>,
}

/// Executes lease passes against the jobs backlog.
#[derive(Clone)]
pub struct LeaseWorker {
    store: Arc<dyn TaggedQueueStore>,
    scheduler: Arc<dyn Scheduler>,
    chooser: Arc<dyn TagChooser>,
    jobs_queue: String,
    worker_queue: String,
    num_tags: usize,
}

impl LeaseWorker {
    pub fn new(
        store: Arc<dyn TaggedQueueStore>,
        scheduler: Arc<dyn Scheduler>,
        chooser: Arc<dyn TagChooser>,
        settings: &QueueSettings,
    ) -> Self {
        Self {
            store,
            scheduler,
            chooser,
            jobs_queue: settings.jobs_queue.clone(),
            worker_queue: settings.worker_queue.clone(),
            num_tags: settings.num_tags.max(1),
        }
    }

    /// Tag filter for a pass: a random variant of the prefix, or empty
    /// (match any) without one.
    pub fn tag_filter(&self, tag_prefix: Option<&str>) -> String {
        match tag_prefix {
            Some(prefix) if !prefix.is_empty() => {
                tag_variant(prefix, self.chooser.choose(self.num_tags))
            }
            _ => String::new(),
        }
    }

    /// Run one pass. On success exactly one follow-up invocation carrying
    /// the same prefix, params and retry policy has been scheduled.
    ///
    /// # Errors
    ///
    /// Lease and scheduling failures, and undecodable payloads, end the pass
    /// without rearming. Failed deletes do not.
    pub async fn run_pass(
        &self,
        tag_prefix: Option<&str>,
        params: &LeaseParams,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<PassReport> {
        let span = start_pass_span("lease_pass", &Uuid::new_v4());
        let started = Instant::now();
        let result = self
            .drive(&span, tag_prefix, params, retry_policy)
            .instrument(span.clone())
            .await;
        metrics::pass_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("kind", "lease_pass")],
        );
        result
    }

    async fn drive(
        &self,
        span: &Span,
        tag_prefix: Option<&str>,
        params: &LeaseParams,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<PassReport> {
        let mut report = PassReport::default();
        let mut leased: Vec<WorkItem> = Vec::new();
        let mut state = PassState::Leasing;

        loop {
            let next = match state {
                PassState::Leasing => {
                    report.tag = self.tag_filter(tag_prefix);
                    record_tag(span, &report.tag);
                    leased = self
                        .store
                        .lease_by_tag(
                            &self.jobs_queue,
                            params.max_to_lease,
                            params.lease_period,
                            &report.tag,
                        )
                        .await?;
                    report.leased = leased.iter().map(|item| item.id).collect();
                    info!(tag = %report.tag, count = leased.len(), "leased items");
                    metrics::items_leased().add(
                        leased.len() as u64,
                        &[KeyValue::new("tag", report.tag.clone())],
                    );
                    self.log_backlog().await;
                    PassState::Inspecting
                }
                PassState::Inspecting => {
                    for item in &leased {
                        if !self.inspect(item)? {
                            report.tag_mismatches += 1;
                        }
                    }
                    PassState::Retiring
                }
                PassState::Retiring => {
                    for item in leased
                        .iter()
                        .filter(|item| item.lease_count >= params.lease_limit)
                    {
                        if self.retire(item).await {
                            report.retired.push(item.id);
                        } else {
                            report.delete_failures += 1;
                        }
                    }
                    PassState::Rearming
                }
                PassState::Rearming => {
                    let mut next =
                        WorkerInvocation::lease_pass(tag_prefix.map(str::to_string), *params);
                    next.retry_policy = retry_policy;
                    let ids = self.scheduler.schedule(&self.worker_queue, vec![next]).await?;
                    report.rearmed = ids.first().copied();
                    debug!(rearmed = ?report.rearmed, "worker rearmed");
                    PassState::Done
                }
                PassState::Done => return Ok(report),
            };
            record_state_transition(span, state.as_str(), next.as_str());
            state = next;
        }
    }

    /// Decode the payload and cross-check its tagname. Returns whether they agree.
    fn inspect(&self, item: &WorkItem) -> Result<bool> {
        let payload = item.decode_payload()?;
        let tagname = payload.tagname();
        debug!(
            id = %item.id,
            tagname = tagname.unwrap_or("-"),
            tag = %item.tag,
            lease_count = item.lease_count,
            "inspecting item"
        );
        let consistent = tagname == Some(item.tag.as_str());
        if !consistent {
            warn!(
                id = %item.id,
                tagname = tagname.unwrap_or("-"),
                tag = %item.tag,
                "payload tagname does not match item tag"
            );
        }
        Ok(consistent)
    }

    /// Best-effort delete. A failure leaves the item to be retired on a later lease.
    async fn retire(&self, item: &WorkItem) -> bool {
        match self.store.delete(&self.jobs_queue, item.id).await {
            Ok(()) => {
                info!(id = %item.id, lease_count = item.lease_count, "retired item");
                metrics::items_retired().add(1, &[KeyValue::new("result", "ok")]);
                true
            }
            Err(e) => {
                warn!(id = %item.id, "retire failed: {e}");
                metrics::items_retired().add(1, &[KeyValue::new("result", "failed")]);
                false
            }
        }
    }

    async fn log_backlog(&self) {
        match self.store.stats(&self.jobs_queue).await {
            Ok(stats) => debug!(total = stats.total, leased = stats.leased, "jobs backlog"),
            Err(e) => debug!("jobs stats unavailable: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_chooser_wraps_around() {
        assert_eq!(FixedTagChooser(1).choose(4), 1);
        assert_eq!(FixedTagChooser(6).choose(4), 2);
    }

    #[test]
    fn random_chooser_stays_in_range() {
        for _ in 0..100 {
            assert!(RandomTagChooser.choose(4) < 4);
        }
        assert_eq!(RandomTagChooser.choose(1), 0);
    }
}
