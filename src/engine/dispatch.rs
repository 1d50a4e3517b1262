//! Dispatcher: runs the invocations waiting in the control queues.
//!
//! Each poll leases pending invocations from the populator and worker
//! queues and runs them as independent tasks. A completed invocation is
//! deleted; a failed one is hidden for its retry policy's backoff and then
//! runs again.

use crate::config::QueueSettings;
use crate::engine::populate::Populator;
use crate::engine::worker::LeaseWorker;
use crate::error::Result;
use crate::model::{InvocationKind, RetryPolicy, WorkItem, WorkerInvocation};
use crate::store::TaggedQueueStore;
use crate::telemetry::lease::{record_tag, start_pass_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

/// The control-queue runtime.
#[derive(Clone)]
pub struct Dispatcher {
    control: Arc<dyn TaggedQueueStore>,
    populator: Populator,
    worker: LeaseWorker,
    populator_queue: String,
    worker_queue: String,
    claim_visibility: Duration,
    poll_interval: Duration,
    max_concurrent: usize,
    default_retry: RetryPolicy,
    shutdown: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        control: Arc<dyn TaggedQueueStore>,
        populator: Populator,
        worker: LeaseWorker,
        settings: &QueueSettings,
    ) -> Self {
        Self {
            control,
            populator,
            worker,
            populator_queue: settings.populator_queue.clone(),
            worker_queue: settings.worker_queue.clone(),
            claim_visibility: settings.claim_visibility(),
            poll_interval: settings.poll_interval(),
            max_concurrent: settings.max_concurrent.max(1),
            default_retry: settings.retry_policy(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the dispatcher to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Poll the control queues until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            populator_queue = %self.populator_queue,
            worker_queue = %self.worker_queue,
            "dispatcher started"
        );

        loop {
            let handled = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("dispatch error: {e}");
                    0
                }
            };

            // Go straight back for more while there is work.
            let pause = if handled > 0 {
                Duration::ZERO
            } else {
                self.poll_interval
            };
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Claim up to `max_concurrent` pending invocations, run them
    /// concurrently, and wait for all of them. Returns how many ran.
    pub async fn run_once(&self) -> Result<usize> {
        let mut claimed: Vec<(String, WorkItem)> = Vec::new();
        for queue in [&self.populator_queue, &self.worker_queue] {
            let room = self.max_concurrent.saturating_sub(claimed.len());
            if room == 0 {
                break;
            }
            let items = self
                .control
                .lease_by_tag(queue, room, self.claim_visibility, "")
                .await?;
            claimed.extend(items.into_iter().map(|item| (queue.clone(), item)));
        }

        let count = claimed.len();
        let mut tasks = JoinSet::new();
        for (queue, item) in claimed {
            let this = self.clone();
            tasks.spawn(async move { this.execute(&queue, item).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("invocation task panicked: {e}");
            }
        }
        Ok(count)
    }

    async fn execute(&self, queue: &str, item: WorkItem) {
        let invocation = match WorkerInvocation::from_item(&item) {
            Ok(inv) => inv,
            Err(e) => {
                error!(id = %item.id, queue, "dead-lettering undecodable invocation: {e}");
                if let Err(e) = self.control.delete(queue, item.id).await {
                    warn!(id = %item.id, queue, "could not drop invocation: {e}");
                }
                return;
            }
        };

        let result = match &invocation.kind {
            InvocationKind::Populate { tag, count } => self.populate(tag, *count).await,
            InvocationKind::LeasePass { tag_prefix, params } => self
                .worker
                .run_pass(tag_prefix.as_deref(), params, invocation.retry_policy)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.control.delete(queue, item.id).await {
                    // It will run again once the claim expires.
                    warn!(id = %item.id, queue, "could not remove completed invocation: {e}");
                }
            }
            Err(e) if e.is_permanent() => {
                error!(id = %item.id, kind = invocation.label(), "dropping invocation: {e}");
                if let Err(e) = self.control.delete(queue, item.id).await {
                    warn!(id = %item.id, queue, "could not drop invocation: {e}");
                }
            }
            Err(e) => {
                let policy = invocation.retry_policy.unwrap_or(self.default_retry);
                let delay = policy.backoff(item.lease_count);
                warn!(
                    id = %item.id,
                    kind = invocation.label(),
                    attempt = item.lease_count,
                    retry_in_ms = delay.as_millis() as u64,
                    "invocation failed: {e}"
                );
                metrics::invocations_failed()
                    .add(1, &[KeyValue::new("kind", invocation.label())]);
                if let Err(e) = self.control.set_visibility(queue, item.id, delay).await {
                    warn!(id = %item.id, queue, "could not schedule retry: {e}");
                }
            }
        }
    }

    async fn populate(&self, tag: &str, count: usize) -> Result<()> {
        let span = start_pass_span("populate", &Uuid::new_v4());
        record_tag(&span, tag);
        self.populator
            .populate(tag, count)
            .instrument(span)
            .await
            .map(|_| ())
    }
}
