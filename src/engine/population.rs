//! Sizing the self-perpetuating worker population.

use crate::config::QueueSettings;
use crate::engine::scheduler::Scheduler;
use crate::error::Result;
use crate::model::{ItemId, LeaseParams, RetryPolicy, WorkerInvocation};
use crate::store::MAX_BATCH_SIZE;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Purge a control queue, then wait out the settle delay.
///
/// A purge has a resolution of about a second and replicas may disagree by
/// another second, so nothing inserted before `settle` has elapsed is
/// guaranteed to survive.
pub async fn purge_and_settle(scheduler: &dyn Scheduler, queue: &str, settle: Duration) -> Result<()> {
    scheduler.purge(queue).await?;
    info!(queue, settle_ms = settle.as_millis() as u64, "purged queue, settling");
    tokio::time::sleep(settle).await;
    Ok(())
}

/// Parse an operator-supplied worker count: missing or unparsable input
/// falls back to `default`, anything else is clamped to `1..=MAX_BATCH_SIZE`.
pub fn parse_worker_count(raw: Option<&str>, default: usize) -> usize {
    let requested = raw
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(default);
    clamp_workers(requested)
}

pub fn clamp_workers(requested: usize) -> usize {
    requested.clamp(1, MAX_BATCH_SIZE)
}

/// Starts and stops the lease-pass population in the worker control queue.
#[derive(Clone)]
pub struct WorkerPopulation {
    scheduler: Arc<dyn Scheduler>,
    worker_queue: String,
    retry_policy: RetryPolicy,
    params: LeaseParams,
    settle: Duration,
}

impl WorkerPopulation {
    pub fn new(scheduler: Arc<dyn Scheduler>, settings: &QueueSettings) -> Self {
        Self {
            scheduler,
            worker_queue: settings.worker_queue.clone(),
            retry_policy: settings.retry_policy(),
            params: settings.lease_params(),
            settle: settings.settle_delay(),
        }
    }

    /// Replace the population with exactly `num_workers` (clamped) fresh workers.
    ///
    /// Pending invocations are purged first, so repeated starts do not add up.
    /// Workers already mid-pass may still rearm once.
    pub async fn start(&self, tag_prefix: Option<&str>, num_workers: usize) -> Result<Vec<ItemId>> {
        let num_workers = clamp_workers(num_workers);
        purge_and_settle(self.scheduler.as_ref(), &self.worker_queue, self.settle).await?;

        let tag_prefix = tag_prefix.filter(|p| !p.is_empty()).map(str::to_string);
        let invocations = (0..num_workers)
            .map(|_| {
                WorkerInvocation::lease_pass(tag_prefix.clone(), self.params)
                    .with_retry_policy(self.retry_policy)
            })
            .collect();

        info!(num_workers, tag_prefix = tag_prefix.as_deref().unwrap_or("-"), "starting workers");
        self.scheduler.schedule(&self.worker_queue, invocations).await
    }

    /// Discard all pending worker invocations. In-flight passes are not recalled.
    pub async fn purge(&self) -> Result<()> {
        purge_and_settle(self.scheduler.as_ref(), &self.worker_queue, self.settle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_defaults_when_missing_or_garbage() {
        assert_eq!(parse_worker_count(None, 5), 5);
        assert_eq!(parse_worker_count(Some("lots"), 5), 5);
        assert_eq!(parse_worker_count(Some("-3"), 5), 5);
        assert_eq!(parse_worker_count(Some(" 12 "), 5), 12);
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(parse_worker_count(Some("150"), 5), 100);
        assert_eq!(parse_worker_count(Some("0"), 5), 1);
        assert_eq!(clamp_workers(100), 100);
    }
}
