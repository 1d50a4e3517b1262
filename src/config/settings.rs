//! Queue tuning knobs.
//!
//! Every field has a default matching the reference deployment, so an empty
//! (or absent) TOML file is a valid configuration.

use crate::error::{Error, Result};
use crate::model::invocation::{LeaseParams, RetryPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Hard limit on items per batch insert, imposed by the queue service.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Data backlog of work items.
    pub jobs_queue: String,
    /// Control queue holding lease-pass invocations.
    pub worker_queue: String,
    /// Control queue holding populate invocations.
    pub populator_queue: String,

    /// Tag variants derived from one prefix.
    pub num_tags: usize,
    /// Items inserted per populate invocation.
    pub populate_count: usize,
    pub default_tag_prefix: String,
    pub default_workers: usize,

    pub max_to_lease: usize,
    pub lease_period_secs: u64,
    pub lease_limit: u32,

    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Wait after a purge before the queue is assumed empty everywhere.
    pub settle_ms: u64,

    pub claim_visibility_secs: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            jobs_queue: "jobs".to_string(),
            worker_queue: "worker".to_string(),
            populator_queue: "populator".to_string(),
            num_tags: 4,
            populate_count: 50,
            default_tag_prefix: "mytag".to_string(),
            default_workers: 5,
            max_to_lease: 3,
            lease_period_secs: 20,
            lease_limit: 2,
            min_backoff_ms: 500,
            max_backoff_ms: 500,
            settle_ms: 2000,
            claim_visibility_secs: 60,
            poll_interval_ms: 500,
            max_concurrent: 8,
        }
    }
}

impl QueueSettings {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn lease_params(&self) -> LeaseParams {
        LeaseParams {
            max_to_lease: self.max_to_lease,
            lease_period: Duration::from_secs(self.lease_period_secs),
            lease_limit: self.lease_limit,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.min_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn claim_visibility(&self) -> Duration {
        Duration::from_secs(self.claim_visibility_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
