//! Scheduled units of work held in the control queues.

use crate::error::{Error, Result};
use crate::model::item::{NewItem, Payload, WorkItem};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Payload key holding the JSON-encoded invocation.
const INVOCATION_KEY: &str = "invocation";

/// What a scheduled invocation runs when the dispatcher picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    /// Insert `count` items tagged `tag` into the jobs backlog.
    Populate { tag: String, count: usize },
    /// Run one lease pass, then rearm.
    LeasePass {
        tag_prefix: Option<String>,
        #[serde(default)]
        params: LeaseParams,
    },
}

/// One scheduled execution of populator or worker logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub kind: InvocationKind,
    /// Backoff applied when this invocation fails and is retried.
    /// `None` defers to the dispatcher's default policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkerInvocation {
    pub fn populate(tag: impl Into<String>, count: usize) -> Self {
        Self {
            kind: InvocationKind::Populate {
                tag: tag.into(),
                count,
            },
            retry_policy: None,
        }
    }

    pub fn lease_pass(tag_prefix: Option<String>, params: LeaseParams) -> Self {
        Self {
            kind: InvocationKind::LeasePass { tag_prefix, params },
            retry_policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Short name used as the control-queue tag and in telemetry.
    pub fn label(&self) -> &'static str {
        match self.kind {
            InvocationKind::Populate { .. } => "populate",
            InvocationKind::LeasePass { .. } => "lease_pass",
        }
    }

    pub fn to_new_item(&self) -> NewItem {
        // Plain data with string keys always serializes.
        let json = serde_json::to_string(self).unwrap_or_default();
        NewItem::new(self.label(), &Payload::new().with(INVOCATION_KEY, json))
    }

    pub fn from_item(item: &WorkItem) -> Result<Self> {
        let payload = item.decode_payload()?;
        let json = payload.first(INVOCATION_KEY).ok_or_else(|| {
            Error::PayloadMalformed(format!("item {} has no {INVOCATION_KEY} key", item.id))
        })?;
        serde_json::from_str(json).map_err(|e| Error::PayloadMalformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Lease parameters
// ---------------------------------------------------------------------------

/// Per-pass leasing knobs, carried in the invocation so rearmed workers keep them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseParams {
    /// Items requested per lease call.
    pub max_to_lease: usize,
    /// Visibility window granted by each lease.
    #[serde(with = "duration_millis")]
    pub lease_period: Duration,
    /// Items leased this many times are deleted.
    pub lease_limit: u32,
}

impl Default for LeaseParams {
    fn default() -> Self {
        Self {
            max_to_lease: 3,
            lease_period: Duration::from_secs(20),
            lease_limit: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Backoff bounds for infrastructure-level retries of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "duration_millis")]
    pub min_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    /// Delay before retrying after the `attempt`-th failed run (1-based).
    ///
    /// Doubles from `min_backoff` and is capped at `max_backoff`; never
    /// shorter than `min_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.min_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
            .max(self.min_backoff)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::item::{DeliveryMethod, ItemId};
    use chrono::Utc;

    fn as_leased(new: NewItem) -> WorkItem {
        WorkItem {
            id: ItemId(7),
            tag: new.tag,
            method: DeliveryMethod::LeaseOnly,
            payload: new.payload,
            lease_count: 1,
            lease_expiry: Utc::now(),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::default();
        for attempt in [0, 1, 2, 10, 40] {
            assert_eq!(policy.backoff(attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn bounded_policy_doubles_up_to_max() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn invocation_survives_the_control_queue() {
        let inv = WorkerInvocation::lease_pass(Some("mytag".into()), LeaseParams::default())
            .with_retry_policy(RetryPolicy::default());
        let item = as_leased(inv.to_new_item());
        assert_eq!(item.tag, "lease_pass");
        assert_eq!(WorkerInvocation::from_item(&item).unwrap(), inv);
    }

    #[test]
    fn item_without_invocation_key_is_malformed() {
        let item = as_leased(NewItem::new("lease_pass", &Payload::for_tag("x")));
        assert!(matches!(
            WorkerInvocation::from_item(&item),
            Err(Error::PayloadMalformed(_))
        ));
    }
}
