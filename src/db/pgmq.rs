//! Tagged queue operations on pgmq via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.send_batch, pgmq.read (with a jsonb
//! containment filter on the tag), pgmq.delete, pgmq.purge_queue. pgmq's
//! `read_ct` is the lease count and `vt` the lease expiry.

use super::Db;
use crate::error::{Error, Result};
use crate::model::{DeliveryMethod, ItemId, NewItem, WorkItem};
use crate::store::{QueueStats, TaggedQueueStore, check_batch, validate_queue_name};
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the JSON message stored in pgmq.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    tag: String,
    #[serde(default)]
    method: DeliveryMethod,
    payload: String,
}

type MessageRow = (i64, i32, DateTime<Utc>, DateTime<Utc>, serde_json::Value);

fn record_op(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// pgmq takes whole seconds for visibility; round up so a lease is never shorter.
fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

fn into_work_item((msg_id, read_ct, enqueued_at, vt, message): MessageRow) -> Result<WorkItem> {
    let envelope: Envelope = serde_json::from_value(message)
        .map_err(|e| Error::PayloadMalformed(format!("message {msg_id}: {e}")))?;
    Ok(WorkItem {
        id: ItemId(msg_id),
        tag: envelope.tag,
        method: envelope.method,
        payload: envelope.payload,
        lease_count: u32::try_from(read_ct).unwrap_or(0),
        lease_expiry: vt,
        enqueued_at,
    })
}

#[async_trait]
impl TaggedQueueStore for Db {
    async fn insert_batch(&self, queue: &str, items: Vec<NewItem>) -> Result<Vec<ItemId>> {
        validate_queue_name(queue)?;
        check_batch(items.len())?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let messages = items
            .into_iter()
            .map(|new| {
                serde_json::to_value(Envelope {
                    tag: new.tag,
                    method: DeliveryMethod::LeaseOnly,
                    payload: new.payload,
                })
                .map_err(|e| Error::Other(format!("encode message: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let rows: Vec<(i64,)> = sqlx::query_as("SELECT * FROM pgmq.send_batch($1, $2)")
            .bind(queue)
            .bind(&messages)
            .fetch_all(&self.pool)
            .await?;
        record_op(queue, "send_batch");
        Ok(rows.into_iter().map(|(id,)| ItemId(id)).collect())
    }

    async fn lease_by_tag(
        &self,
        queue: &str,
        max_items: usize,
        visibility: Duration,
        tag: &str,
    ) -> Result<Vec<WorkItem>> {
        validate_queue_name(queue)?;
        let conditional = if tag.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::json!({ "tag": tag })
        };

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3, $4)",
        )
        .bind(queue)
        .bind(whole_seconds(visibility))
        .bind(i32::try_from(max_items).unwrap_or(i32::MAX))
        .bind(&conditional)
        .fetch_all(&self.pool)
        .await?;

        record_op(queue, if rows.is_empty() { "read_empty" } else { "read" });
        rows.into_iter().map(into_work_item).collect()
    }

    async fn delete(&self, queue: &str, id: ItemId) -> Result<()> {
        validate_queue_name(queue)?;
        let row: (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        record_op(queue, "delete");
        if row.0 {
            Ok(())
        } else {
            Err(Error::DeleteFailed {
                queue: queue.to_string(),
                id: id.0,
            })
        }
    }

    async fn purge(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        sqlx::query("SELECT pgmq.purge_queue($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        record_op(queue, "purge");
        Ok(())
    }

    async fn set_visibility(&self, queue: &str, id: ItemId, delay: Duration) -> Result<()> {
        validate_queue_name(queue)?;
        // Direct update keeps sub-second precision; pgmq.set_vt only takes seconds.
        let sql = format!(
            "UPDATE pgmq.q_{queue} SET vt = clock_timestamp() + make_interval(secs => $1) \
             WHERE msg_id = $2"
        );
        let result = sqlx::query(&sql)
            .bind(delay.as_secs_f64())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        record_op(queue, "set_vt");
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("item {id} in queue {queue}")));
        }
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        validate_queue_name(queue)?;
        let sql = format!(
            "SELECT count(*), count(*) FILTER (WHERE vt > clock_timestamp()) FROM pgmq.q_{queue}"
        );
        let (total, leased): (i64, i64) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            total: u64::try_from(total).unwrap_or(0),
            leased: u64::try_from(leased).unwrap_or(0),
        })
    }
}
