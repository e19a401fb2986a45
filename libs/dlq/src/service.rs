//! The dead-letter queue service.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use health::HealthResult;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DLQConfig;
use crate::domain::{DeadLetterEntry, FailureCategory, FailureDetail};
use crate::error::DlqError;
use crate::metrics;
use crate::DlqResult;

/// Atomic redrive: read the entry, append it to the target stream and delete
/// it from the DLQ in one server-side unit. Doing these as separate round
/// trips could lose the message (crash between read and add) or duplicate it
/// (crash between add and delete).
static REDRIVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local dlq_stream = KEYS[1]
local target_stream = KEYS[2]
local stream_id = ARGV[1]

local entries = redis.call('XRANGE', dlq_stream, stream_id, stream_id)
if #entries == 0 then
    return nil
end

local fields = entries[1][2]
redis.call('XADD', target_stream, '*', unpack(fields))
redis.call('XDEL', dlq_stream, stream_id)

return 1
"#,
    )
});

/// Options for [`DeadLetterQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Retry attempts before DLQ routing.
    pub retry_count: u32,
    pub category: FailureCategory,
    /// Arbitrary caller headers, stored under `meta_`-prefixed keys.
    pub metadata: HashMap<String, String>,
    /// Entry id; a fresh UUID is generated when empty.
    pub entry_id: Option<String>,
}

impl EnqueueOptions {
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_category(mut self, category: FailureCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }
}

/// Dead-letter queue on a Redis stream with one consumer group.
///
/// Instance state (`consumer_id`, the initialized cell) is set once and then
/// read-only; a connection is cloned from the shared manager per operation.
pub struct DeadLetterQueue {
    redis: Arc<ConnectionManager>,
    config: DLQConfig,
    consumer_id: String,
    initialized: OnceCell<()>,
}

impl DeadLetterQueue {
    /// Create a queue after validating the config.
    pub fn new(redis: ConnectionManager, config: DLQConfig) -> DlqResult<Self> {
        config.validate()?;
        Ok(Self {
            redis: Arc::new(redis),
            config,
            consumer_id: new_consumer_id(),
            initialized: OnceCell::new(),
        })
    }

    /// Unique identifier of this consumer instance.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// The Redis stream backing this DLQ.
    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    pub fn config(&self) -> &DLQConfig {
        &self.config
    }

    /// Create the consumer group (with stream auto-creation) at id `"0"`.
    ///
    /// Idempotent, including against a group created by another instance:
    /// the broker's BUSYGROUP reply is treated as success. Concurrent
    /// callers are serialized by the init cell.
    pub async fn initialize(&self) -> DlqResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                let mut conn = (*self.redis).clone();

                let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(&self.config.stream_name)
                    .arg(&self.config.consumer_group)
                    .arg("0")
                    .arg("MKSTREAM")
                    .query_async(&mut conn)
                    .await;

                match result {
                    Ok(()) => {
                        info!(
                            stream = %self.config.stream_name,
                            group = %self.config.consumer_group,
                            "Created DLQ consumer group"
                        );
                    }
                    Err(e) if e.code() == Some("BUSYGROUP") => {
                        debug!(
                            stream = %self.config.stream_name,
                            group = %self.config.consumer_group,
                            "Consumer group already exists"
                        );
                    }
                    Err(e) => return Err(DlqError::ConsumerGroup(e.to_string())),
                }

                info!(
                    stream = %self.config.stream_name,
                    consumer_id = %self.consumer_id,
                    "DLQ initialized"
                );
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Route a failed message to the DLQ. Returns the broker-assigned
    /// stream position.
    ///
    /// The stream is capped at `max_stream_length`; oldest entries are
    /// trimmed on append.
    pub async fn enqueue(
        &self,
        payload: &[u8],
        failure: &FailureDetail,
        source_queue: &str,
        options: EnqueueOptions,
    ) -> DlqResult<String> {
        let entry_id = options
            .entry_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let entry = DeadLetterEntry {
            id: entry_id,
            stream_id: String::new(),
            payload: payload.to_vec(),
            error_type: failure.error_type.clone(),
            error_message: failure.message.clone(),
            error_traceback: failure.traceback.clone(),
            retry_count: options.retry_count,
            requeue_count: 0,
            category: options.category,
            source_queue: source_queue.to_string(),
            timestamp: Utc::now(),
            metadata: options.metadata,
        };

        let mut conn = (*self.redis).clone();
        let stream_id = self.xadd_entry(&mut conn, &entry).await?;

        warn!(
            stream_id = %stream_id,
            entry_id = %entry.id,
            error_type = %entry.error_type,
            category = %entry.category,
            source_queue = %source_queue,
            "Routed to DLQ"
        );
        metrics::record_enqueued(&self.config.stream_name);

        Ok(stream_id)
    }

    /// Consuming read through the consumer group. Returned entries are
    /// pending until acknowledged, requeued or claimed by another consumer.
    ///
    /// Blocks up to `block_timeout_ms` when the stream has nothing new;
    /// returning empty after the timeout is normal, not an error.
    pub async fn read(&self, max_count: Option<usize>) -> DlqResult<Vec<DeadLetterEntry>> {
        self.ensure_initialized()?;
        let count = max_count.unwrap_or(self.config.batch_size);

        let mut options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.consumer_id)
            .count(count);
        if self.config.block_timeout_ms > 0 {
            options = options.block(self.config.block_timeout_ms as usize);
        }

        let mut conn = (*self.redis).clone();
        let result: Result<StreamReadReply, _> = conn
            .xread_options(&[&self.config.stream_name], &[">"], &options)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            // BLOCK expiry surfaces as a nil/timeout-shaped error; an empty
            // read is normal.
            Err(e) if is_block_timeout(&e) => return Ok(Vec::new()),
            Err(e) => return Err(DlqError::Redis(e)),
        };

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for message in stream_key.ids {
                let fields = decode_fields(&message.map);
                entries.push(parse_entry(&message.id, &fields)?);
            }
        }

        if !entries.is_empty() {
            info!(
                count = entries.len(),
                consumer_id = %self.consumer_id,
                "Read entries from DLQ"
            );
        }

        Ok(entries)
    }

    /// Inspect entries without consuming them: a plain range read that does
    /// not touch consumer-group pending state.
    pub async fn peek(&self, max_count: usize) -> DlqResult<Vec<DeadLetterEntry>> {
        self.ensure_initialized()?;

        let mut conn = (*self.redis).clone();
        let reply: StreamRangeReply = conn
            .xrange_count(&self.config.stream_name, "-", "+", max_count)
            .await?;

        let mut entries = Vec::new();
        for stream_entry in reply.ids {
            let fields = decode_fields(&stream_entry.map);
            entries.push(parse_entry(&stream_entry.id, &fields)?);
        }
        Ok(entries)
    }

    /// Acknowledge processed entries. Returns the count the broker
    /// reported. Idempotent; no broker call is made for an empty input.
    ///
    /// Entries without a stream position are skipped with a warning: they
    /// were never delivered through the group, so there is nothing to ack.
    pub async fn acknowledge(&self, entries: &[DeadLetterEntry]) -> DlqResult<usize> {
        self.ensure_initialized()?;
        if entries.is_empty() {
            return Ok(0);
        }

        let stream_ids: Vec<&str> = entries
            .iter()
            .filter(|entry| !entry.stream_id.is_empty())
            .map(|entry| entry.stream_id.as_str())
            .collect();

        let skipped = entries.len() - stream_ids.len();
        if skipped > 0 {
            warn!(skipped, "Skipping entries without a stream id in acknowledge");
        }
        if stream_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = (*self.redis).clone();
        let acked: i64 = conn
            .xack(
                &self.config.stream_name,
                &self.config.consumer_group,
                &stream_ids,
            )
            .await?;

        info!(count = acked, "Acknowledged DLQ entries");
        Ok(acked as usize)
    }

    /// Requeue an entry with an incremented requeue count, acknowledging
    /// the original.
    ///
    /// Returns the new stream position, or `None` when the entry exceeded
    /// `max_requeue_attempts` — in that case the original is acked and the
    /// message is permanently discarded; monitor the discard counter.
    ///
    /// The append and the ack run on the same connection to narrow the
    /// window in which both copies are live.
    pub async fn requeue(&self, entry: &DeadLetterEntry) -> DlqResult<Option<String>> {
        self.ensure_initialized()?;
        let new_requeue_count = entry.requeue_count + 1;

        if new_requeue_count > self.config.max_requeue_attempts {
            error!(
                entry_id = %entry.id,
                requeue_count = entry.requeue_count,
                max_attempts = self.config.max_requeue_attempts,
                "Entry exceeded max requeue attempts, discarding"
            );
            metrics::record_discarded(&self.config.stream_name);
            self.acknowledge(std::slice::from_ref(entry)).await?;
            return Ok(None);
        }

        let requeued = entry.with_requeue_count(new_requeue_count);

        let mut conn = (*self.redis).clone();
        let stream_id = self.xadd_entry(&mut conn, &requeued).await?;
        if !entry.stream_id.is_empty() {
            let _: i64 = conn
                .xack(
                    &self.config.stream_name,
                    &self.config.consumer_group,
                    &[entry.stream_id.as_str()],
                )
                .await?;
        }

        warn!(
            entry_id = %entry.id,
            old_stream_id = %entry.stream_id,
            new_stream_id = %stream_id,
            requeue_count = new_requeue_count,
            "Requeued DLQ entry"
        );
        metrics::record_requeued(&self.config.stream_name);

        Ok(Some(stream_id))
    }

    /// Claim pending entries whose consumer has been idle past
    /// `claim_timeout_ms`, reassigning them to this consumer. Returns the
    /// claimed entries; empty when nothing is stale.
    pub async fn claim_stale(&self) -> DlqResult<Vec<DeadLetterEntry>> {
        self.ensure_initialized()?;
        let mut conn = (*self.redis).clone();

        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.stream_name,
                &self.config.consumer_group,
                "-",
                "+",
                self.config.batch_size,
            )
            .await?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|entry| entry.last_delivered_ms as u64 > self.config.claim_timeout_ms)
            .map(|entry| entry.id)
            .collect();

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream_name,
                &self.config.consumer_group,
                &self.consumer_id,
                self.config.claim_timeout_ms,
                &stale_ids,
            )
            .await?;

        let mut entries = Vec::new();
        for stream_entry in claimed.ids {
            let fields = decode_fields(&stream_entry.map);
            entries.push(parse_entry(&stream_entry.id, &fields)?);
        }

        if !entries.is_empty() {
            info!(
                count = entries.len(),
                consumer_id = %self.consumer_id,
                "Claimed stale DLQ entries"
            );
            metrics::record_claimed(&self.config.stream_name, entries.len() as u64);
        }

        Ok(entries)
    }

    /// Atomically move one entry from the DLQ to
    /// `{key_prefix}:queue:{target_queue}`. Returns `false` when the entry
    /// does not exist.
    pub async fn redrive_one(&self, stream_id: &str, target_queue: &str) -> DlqResult<bool> {
        self.ensure_initialized()?;
        let target_stream = self.config.main_queue_key(target_queue);

        let mut conn = (*self.redis).clone();
        let moved: Option<i64> = REDRIVE_SCRIPT
            .key(&self.config.stream_name)
            .key(&target_stream)
            .arg(stream_id)
            .invoke_async(&mut conn)
            .await?;

        if moved.is_some() {
            info!(
                stream_id = %stream_id,
                target_queue = %target_queue,
                "Redrove entry from DLQ"
            );
            metrics::record_redriven(&self.config.stream_name, 1);
            Ok(true)
        } else {
            warn!(stream_id = %stream_id, "Entry not found in DLQ");
            Ok(false)
        }
    }

    /// Redrive entries to `{key_prefix}:queue:{target_queue}` in stream
    /// order, in batches of `batch_size`.
    ///
    /// Each matching entry is appended to the target stream as a reduced
    /// representation (`message_id`, `payload`, bare metadata keys) and the
    /// originals are deleted in batch. Stops at `max_count` when set, or at
    /// the end of the stream (a short page).
    pub async fn redrive_many(
        &self,
        target_queue: &str,
        predicate: Option<&(dyn Fn(&DeadLetterEntry) -> bool + Sync)>,
        max_count: Option<usize>,
    ) -> DlqResult<usize> {
        self.ensure_initialized()?;
        let target_stream = self.config.main_queue_key(target_queue);

        let mut conn = (*self.redis).clone();
        let mut redriven = 0usize;
        let mut last_id = "-".to_string();

        loop {
            let remaining = max_count.map(|max| max.saturating_sub(redriven));
            if remaining == Some(0) {
                break;
            }
            let fetch_count =
                remaining.map_or(self.config.batch_size, |r| r.min(self.config.batch_size));

            let page: StreamRangeReply = conn
                .xrange_count(&self.config.stream_name, &last_id, "+", fetch_count)
                .await?;
            if page.ids.is_empty() {
                break;
            }
            let page_len = page.ids.len();

            let mut ids_to_delete: Vec<String> = Vec::new();
            for stream_entry in page.ids {
                // The range start is inclusive; skip the previous page's tail.
                if stream_entry.id == last_id {
                    continue;
                }
                last_id = stream_entry.id.clone();

                let fields = decode_fields(&stream_entry.map);
                let entry = parse_entry(&stream_entry.id, &fields)?;

                if let Some(keep) = predicate
                    && !keep(&entry)
                {
                    continue;
                }

                let mut cmd = redis::cmd("XADD");
                cmd.arg(&target_stream)
                    .arg("*")
                    .arg("message_id")
                    .arg(&entry.id)
                    .arg("payload")
                    .arg(BASE64.encode(&entry.payload));
                for (key, value) in &entry.metadata {
                    cmd.arg(key).arg(value);
                }
                let _: String = cmd.query_async(&mut conn).await?;

                ids_to_delete.push(stream_entry.id.clone());
                redriven += 1;

                if max_count.is_some_and(|max| redriven >= max) {
                    break;
                }
            }

            if !ids_to_delete.is_empty() {
                let _: i64 = conn.xdel(&self.config.stream_name, &ids_to_delete).await?;
            }

            if page_len < fetch_count {
                break;
            }
        }

        info!(
            target_queue = %target_queue,
            redriven_count = redriven,
            "Completed DLQ redrive"
        );
        metrics::record_redriven(&self.config.stream_name, redriven as u64);

        Ok(redriven)
    }

    /// Current stream length.
    pub async fn get_message_count(&self) -> DlqResult<usize> {
        let mut conn = (*self.redis).clone();
        let length: usize = conn.xlen(&self.config.stream_name).await?;
        metrics::set_depth(&self.config.stream_name, length as f64);
        Ok(length)
    }

    /// Delivered-but-unacknowledged entries in the consumer group.
    pub async fn get_pending_count(&self) -> DlqResult<usize> {
        let mut conn = (*self.redis).clone();
        let reply: StreamPendingReply = conn
            .xpending(&self.config.stream_name, &self.config.consumer_group)
            .await?;
        let pending = reply.count();
        metrics::set_pending(&self.config.stream_name, pending as f64);
        Ok(pending)
    }

    /// Probe the broker with a PING.
    pub async fn health_check(&self) -> HealthResult {
        if self.initialized.get().is_none() {
            return HealthResult::initializing(0);
        }

        let mut conn = (*self.redis).clone();
        let started = Instant::now();
        let result: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;

        match result {
            Ok(_) => HealthResult::healthy(0, 0, 0, started.elapsed().as_secs_f64()),
            Err(e) => HealthResult::unhealthy(0, e.to_string()),
        }
    }

    fn ensure_initialized(&self) -> DlqResult<()> {
        if self.initialized.get().is_none() {
            return Err(DlqError::NotInitialized);
        }
        Ok(())
    }

    /// Append an entry to the DLQ stream, trimming to `max_stream_length`.
    async fn xadd_entry(
        &self,
        conn: &mut ConnectionManager,
        entry: &DeadLetterEntry,
    ) -> DlqResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.config.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_stream_length)
            .arg("*");
        for (key, value) in entry_fields(entry) {
            cmd.arg(key).arg(value);
        }

        let stream_id: String = cmd.query_async(conn).await?;
        Ok(stream_id)
    }
}

/// Consumer ids are `worker_` plus 8 hex characters of a fresh UUID.
fn new_consumer_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("worker_{}", &uuid[..8])
}

/// Wire layout of one stream entry. Payload bytes travel base64-encoded;
/// metadata keys get a `meta_` prefix.
fn entry_fields(entry: &DeadLetterEntry) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".to_string(), entry.id.clone()),
        ("timestamp".to_string(), entry.timestamp.to_rfc3339()),
        ("source_queue".to_string(), entry.source_queue.clone()),
        ("payload".to_string(), BASE64.encode(&entry.payload)),
        ("error_type".to_string(), entry.error_type.clone()),
        ("error_message".to_string(), entry.error_message.clone()),
        ("error_traceback".to_string(), entry.error_traceback.clone()),
        ("retry_count".to_string(), entry.retry_count.to_string()),
        ("requeue_count".to_string(), entry.requeue_count.to_string()),
        ("category".to_string(), entry.category.as_str().to_string()),
    ];

    for (key, value) in &entry.metadata {
        fields.push((format!("meta_{key}"), value.clone()));
    }

    fields
}

/// Decode raw Redis field values to strings (bytes become lossy UTF-8).
fn decode_fields(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    let mut fields = HashMap::with_capacity(map.len());
    for (key, value) in map {
        let decoded = match value {
            redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
            redis::Value::SimpleString(text) => text.clone(),
            redis::Value::Int(number) => number.to_string(),
            _ => continue,
        };
        fields.insert(key.clone(), decoded);
    }
    fields
}

/// Parse decoded fields into an entry.
///
/// Tolerant of bad non-payload fields (logged fallbacks); a payload that
/// fails base64 decoding surfaces as [`DlqError::CorruptPayload`].
fn parse_entry(stream_id: &str, fields: &HashMap<String, String>) -> DlqResult<DeadLetterEntry> {
    let entry_id = fields.get("id").cloned().unwrap_or_default();

    let mut metadata = HashMap::new();
    for (key, value) in fields {
        if let Some(name) = key.strip_prefix("meta_") {
            metadata.insert(name.to_string(), value.clone());
        }
    }

    let timestamp = match fields.get("timestamp").filter(|raw| !raw.is_empty()) {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => {
                warn!(
                    raw_timestamp = %raw,
                    entry_id = %entry_id,
                    "Invalid timestamp format, using current time"
                );
                Utc::now()
            }
        },
        None => Utc::now(),
    };

    let category = fields
        .get("category")
        .map(|raw| FailureCategory::parse_lossy(raw))
        .unwrap_or_default();

    let payload = match fields.get("payload").filter(|raw| !raw.is_empty()) {
        Some(raw) => BASE64.decode(raw).map_err(|source| {
            error!(
                entry_id = %entry_id,
                stream_id = %stream_id,
                error = %source,
                "Base64 decode failed - entry corrupted"
            );
            DlqError::CorruptPayload {
                entry_id: entry_id.clone(),
                stream_id: stream_id.to_string(),
                source,
            }
        })?,
        None => Vec::new(),
    };

    Ok(DeadLetterEntry {
        id: entry_id,
        stream_id: stream_id.to_string(),
        payload,
        error_type: fields.get("error_type").cloned().unwrap_or_default(),
        error_message: fields.get("error_message").cloned().unwrap_or_default(),
        error_traceback: fields.get("error_traceback").cloned().unwrap_or_default(),
        retry_count: safe_int(fields.get("retry_count")),
        requeue_count: safe_int(fields.get("requeue_count")),
        category,
        source_queue: fields.get("source_queue").cloned().unwrap_or_default(),
        timestamp,
        metadata,
    })
}

/// Parse a counter with a zero fallback for corrupted data.
fn safe_int(value: Option<&String>) -> u32 {
    match value {
        None => 0,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(value = %raw, "Invalid integer value, using 0");
            0
        }),
    }
}

/// BLOCK expiry shows up as a timeout/nil-shaped error depending on the
/// connection layer; neither is a real fault.
fn is_block_timeout(error: &redis::RedisError) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("timed out")
        || text.contains("timeout")
        || text.contains("nil")
        || (text.contains("response") && text.contains("type"))
}
