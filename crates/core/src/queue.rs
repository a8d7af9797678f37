//! Redis queue adapter.
//!
//! Wraps a `ConnectionManager` (auto-reconnecting, cheaply cloneable) and
//! exposes the queue primitives the workers need: blocking list pops with
//! batch draining, heartbeat keys, stream consumer groups with auto-claim,
//! and the pipelined response-publish + ack used by the text-embed responder.
//!
//! The adapter tolerates server resets: a missing consumer group is
//! re-created and the operation retried, and a response publish whose ack
//! hits NOGROUP still delivers the response so the caller is unblocked.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use crate::config::RedisConfig;

/// A single stream entry with its decoded field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }
}

/// Detect stream/group-missing errors left behind by a Redis reset.
pub fn is_no_group_error(message: &str) -> bool {
    message.to_uppercase().contains("NOGROUP")
}

/// Detect the BLOCK-timeout / nil replies that mean "no messages", not failure.
fn is_timeout_reply(err: &redis::RedisError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("nil")
        || (msg.contains("response") && msg.contains("type"))
}

#[derive(Clone)]
pub struct QueueClient {
    manager: ConnectionManager,
    url: String,
}

impl QueueClient {
    /// Connect and verify reachability with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .with_context(|| format!("Failed to create Redis client for URL: {}", config.url))?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        let mut conn = manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed — is the server reachable?")?;
        debug!("Redis connected (PING → {pong})");

        Ok(Self {
            manager,
            url: config.url.clone(),
        })
    }

    // ── Lists ────────────────────────────────────────────────────────────

    /// BLPOP with timeout. Returns `None` when the pop timed out.
    pub async fn blocking_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let result: Option<(String, String)> = conn
            .blpop(queue, timeout.as_secs_f64())
            .await
            .with_context(|| format!("BLPOP {} failed", queue))?;
        Ok(result.map(|(_, payload)| payload))
    }

    /// Non-blocking LPOP of a single payload.
    pub async fn pop(&self, queue: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn
            .lpop(queue, None)
            .await
            .with_context(|| format!("LPOP {} failed", queue))?;
        Ok(payload)
    }

    /// Drain up to `max` additional payloads without blocking.
    pub async fn drain(&self, queue: &str, max: usize) -> Result<Vec<String>> {
        let mut drained = Vec::new();
        while drained.len() < max {
            match self.pop(queue).await? {
                Some(payload) => drained.push(payload),
                None => break,
            }
        }
        Ok(drained)
    }

    /// Fire-and-forget RPUSH.
    pub async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .rpush(queue, payload)
            .await
            .with_context(|| format!("RPUSH {} failed", queue))?;
        Ok(())
    }

    /// Push a batch of payloads in one pipeline round-trip.
    pub async fn push_many(&self, queue: &str, payloads: &[String]) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for payload in payloads {
            pipe.rpush(queue, payload).ignore();
        }
        let mut conn = self.manager.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .with_context(|| format!("pipelined RPUSH {} failed", queue))?;
        Ok(())
    }

    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let len: usize = conn
            .llen(queue)
            .await
            .with_context(|| format!("LLEN {} failed", queue))?;
        Ok(len)
    }

    /// Publish a heartbeat key holding the current unix-millis timestamp.
    /// Heartbeats are informational; failures are logged and swallowed.
    pub async fn set_heartbeat(&self, key: &str) {
        let millis = chrono::Utc::now().timestamp_millis().to_string();
        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> = conn.set(key, millis).await;
        if let Err(e) = result {
            warn!(error = %e, key, "Failed to publish worker heartbeat");
        }
    }

    // ── Streams / consumer groups ────────────────────────────────────────

    /// XGROUP CREATE … MKSTREAM, tolerating an already-existing group.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("XGROUP CREATE {} {} failed", stream, group)),
        }
    }

    /// XREADGROUP one new entry with a bounded block. Returns `None` on
    /// timeout. A NOGROUP reply re-creates the group and returns `None`.
    pub async fn read_group_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>> {
        let mut conn = self.manager.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block.as_millis() as usize);

        let result: Result<StreamReadReply, redis::RedisError> =
            conn.xread_options(&[stream], &[">"], &opts).await;

        match result {
            Ok(reply) => Ok(parse_reply(reply).into_iter().next()),
            Err(e) if is_timeout_reply(&e) => Ok(None),
            Err(e) if is_no_group_error(&e.to_string()) => {
                warn!(
                    stream,
                    group, "Stream/group missing (likely Redis reset); recreating consumer group"
                );
                self.ensure_group(stream, group).await?;
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("XREADGROUP {} failed", stream)),
        }
    }

    /// XAUTOCLAIM entries idle for at least `min_idle_ms`, recovering work
    /// from crashed consumers. Returns the claimed entries.
    pub async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.manager.clone();
        let result: Result<redis::Value, redis::RedisError> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(v) => v,
            // Older servers without XAUTOCLAIM simply skip the recovery pass.
            Err(e) if e.to_string().to_lowercase().contains("unknown command") => {
                return Ok(Vec::new());
            }
            Err(e) if is_no_group_error(&e.to_string()) => {
                self.ensure_group(stream, group).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).with_context(|| format!("XAUTOCLAIM {} failed", stream)),
        };

        Ok(parse_autoclaim(value))
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .xack(stream, group, &[id])
            .await
            .with_context(|| format!("XACK {} failed", stream))?;
        Ok(())
    }

    /// Publish a response payload and acknowledge the stream entry in one
    /// pipelined round-trip (LPUSH + EXPIRE + XACK).
    ///
    /// If the server lost the group between read and ack, the response is
    /// still published (to unblock the caller) and the group is re-created;
    /// the un-acked entry is dropped.
    pub async fn publish_response(
        &self,
        response_key: &str,
        payload: &str,
        ttl_secs: u64,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        let result: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .lpush(response_key, payload)
            .ignore()
            .expire(response_key, ttl_secs as i64)
            .ignore()
            .xack(stream, group, &[entry_id])
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_no_group_error(&e.to_string()) => {
                warn!(
                    stream,
                    group,
                    "Response ack failed due to missing group; publishing without ack and recreating group"
                );
                self.ensure_group(stream, group).await?;
                let _: () = redis::pipe()
                    .atomic()
                    .lpush(response_key, payload)
                    .ignore()
                    .expire(response_key, ttl_secs as i64)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .context("fallback response publish failed")?;
                Ok(())
            }
            Err(e) => Err(e).context("pipelined response publish failed"),
        }
    }

    // ── Pub/sub ──────────────────────────────────────────────────────────

    /// Open a dedicated pub/sub connection subscribed to `channel`.
    ///
    /// Pub/sub needs its own connection (the multiplexed manager cannot
    /// carry subscriptions), so this dials a fresh one from the stored URL.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub> {
        let client = Client::open(self.url.as_str())
            .with_context(|| format!("Failed to create Redis client for URL: {}", self.url))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("Failed to open pub/sub connection")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("SUBSCRIBE {} failed", channel))?;
        info!(channel, "Subscribed to control channel");
        Ok(pubsub)
    }
}

fn decode_field_value(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    let mut entries = Vec::new();
    for key in reply.keys {
        for message in key.ids {
            let fields = message
                .map
                .iter()
                .filter_map(|(name, value)| {
                    decode_field_value(value).map(|v| (name.clone(), v))
                })
                .collect();
            entries.push(StreamEntry {
                id: message.id,
                fields,
            });
        }
    }
    entries
}

/// Parse the XAUTOCLAIM reply: `[next-start-id, [[id, [k, v, …]], …], …]`.
fn parse_autoclaim(value: redis::Value) -> Vec<StreamEntry> {
    let mut entries = Vec::new();

    let redis::Value::Array(outer) = value else {
        return entries;
    };
    let Some(redis::Value::Array(messages)) = outer.get(1) else {
        return entries;
    };

    for message in messages {
        let redis::Value::Array(pair) = message else {
            continue;
        };
        let Some(id) = pair.first().and_then(decode_field_value) else {
            continue;
        };
        let mut fields = HashMap::new();
        if let Some(redis::Value::Array(raw_fields)) = pair.get(1) {
            for chunk in raw_fields.chunks(2) {
                if let [name, value] = chunk
                    && let (Some(name), Some(value)) =
                        (decode_field_value(name), decode_field_value(value))
                {
                    fields.insert(name, value);
                }
            }
        }
        entries.push(StreamEntry { id, fields });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_group_detection_is_case_insensitive() {
        assert!(is_no_group_error(
            "NOGROUP No such consumer group 'g' for key name 's'"
        ));
        assert!(is_no_group_error("nogroup: gone"));
        assert!(!is_no_group_error("BUSYGROUP Consumer Group name exists"));
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let value = redis::Value::Array(vec![
            redis::Value::BulkString(b"0-0".to_vec()),
            redis::Value::Array(vec![redis::Value::Array(vec![
                redis::Value::BulkString(b"1-1".to_vec()),
                redis::Value::Array(vec![
                    redis::Value::BulkString(b"requestId".to_vec()),
                    redis::Value::BulkString(b"r1".to_vec()),
                    redis::Value::BulkString(b"text".to_vec()),
                    redis::Value::BulkString(b"mellow jazz".to_vec()),
                ]),
            ])]),
        ]);

        let entries = parse_autoclaim(value);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-1");
        assert_eq!(entries[0].field("requestId").as_deref(), Some("r1"));
        assert_eq!(entries[0].field("text").as_deref(), Some("mellow jazz"));
    }

    #[test]
    fn test_parse_autoclaim_tolerates_nil() {
        assert!(parse_autoclaim(redis::Value::Nil).is_empty());
    }
}
