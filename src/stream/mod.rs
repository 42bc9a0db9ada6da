//! Progress stream channels
//!
//! A channel is an append-only sequence of `{id, event, data}` records under
//! `<channel_id>:events`, written by the one worker that owns the job and
//! read by any number of tails. `internal` events steer clients and are not
//! shown to users; `message` (or the legacy `msg`) carry content lines.
//!
//! Redis backs channels in deployments; an in-process backend serves local
//! runs and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::store::Store;

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_LEGACY_MESSAGE: &str = "msg";
pub const EVENT_INTERNAL: &str = "internal";
pub const EVENT_TITLE: &str = "title";

/// `data.type` of the internal event that ends a channel
pub const CLOSE_TYPE: &str = "close";

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed stream record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Position in the channel, starting at 1
    pub id: u64,
    pub event: String,
    pub data: Value,
}

impl StreamEvent {
    pub fn is_visible(&self) -> bool {
        self.event != EVENT_INTERNAL
    }

    pub fn is_close(&self) -> bool {
        self.event == EVENT_INTERNAL && self.data.get("type").and_then(Value::as_str) == Some(CLOSE_TYPE)
    }

    /// Text of a content line
    pub fn content_line(&self) -> Option<&str> {
        match self.event.as_str() {
            EVENT_MESSAGE | EVENT_LEGACY_MESSAGE => self
                .data
                .get("line")
                .and_then(Value::as_str)
                .or_else(|| self.data.as_str()),
            _ => None,
        }
    }
}

pub fn events_key(channel: Uuid) -> String {
    format!("{}:events", channel)
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ChannelBackend: Send + Sync {
    async fn append(&self, channel: Uuid, event: &str, data: Value) -> Result<StreamEvent, StreamError>;

    /// Records with an id above `after`
    async fn read_since(&self, channel: Uuid, after: u64) -> Result<Vec<StreamEvent>, StreamError>;

    async fn expire(&self, channel: Uuid, ttl: Duration) -> Result<(), StreamError>;
}

// ============================================================================
// SBIO: I/O implementation (Redis lists)
// ============================================================================

pub struct RedisChannels {
    client: redis::Client,
    conn: OnceCell<redis::aio::MultiplexedConnection>,
}

impl RedisChannels {
    pub fn open(url: &str) -> Result<Self, StreamError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StreamError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }
}

/// Counter the writer bumps to number the next record
fn sequence_key(channel: Uuid) -> String {
    format!("{}:seq", channel)
}

fn encode_record(record: &StreamEvent) -> Result<String, StreamError> {
    serde_json::to_string(record).map_err(|e| StreamError::Malformed(e.to_string()))
}

fn decode_record(line: &str) -> Result<StreamEvent, StreamError> {
    serde_json::from_str(line).map_err(|e| StreamError::Malformed(e.to_string()))
}

#[async_trait]
impl ChannelBackend for RedisChannels {
    async fn append(&self, channel: Uuid, event: &str, data: Value) -> Result<StreamEvent, StreamError> {
        let mut conn = self.conn().await?;
        let id: u64 = conn.incr(sequence_key(channel), 1).await?;
        let record = StreamEvent {
            id,
            event: event.to_string(),
            data,
        };
        let _: u64 = conn.rpush(events_key(channel), encode_record(&record)?).await?;
        Ok(record)
    }

    async fn read_since(&self, channel: Uuid, after: u64) -> Result<Vec<StreamEvent>, StreamError> {
        let mut conn = self.conn().await?;
        // Ids are dense from 1, so the record after `after` sits at index `after`
        let raw: Vec<String> = conn.lrange(events_key(channel), after as isize, -1).await?;
        let mut events = Vec::with_capacity(raw.len());
        for line in raw {
            let record = decode_record(&line)?;
            if record.id > after {
                events.push(record);
            }
        }
        Ok(events)
    }

    async fn expire(&self, channel: Uuid, ttl: Duration) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let ttl = ttl.as_secs() as i64;
        let _: bool = conn.expire(events_key(channel), ttl).await?;
        let _: bool = conn.expire(sequence_key(channel), ttl).await?;
        Ok(())
    }
}

// ============================================================================
// SBIO: In-process implementation
// ============================================================================

#[derive(Default)]
pub struct MemoryChannels {
    channels: DashMap<Uuid, Vec<StreamEvent>>,
}

#[async_trait]
impl ChannelBackend for MemoryChannels {
    async fn append(&self, channel: Uuid, event: &str, data: Value) -> Result<StreamEvent, StreamError> {
        let mut events = self.channels.entry(channel).or_default();
        let record = StreamEvent {
            id: events.len() as u64 + 1,
            event: event.to_string(),
            data,
        };
        events.push(record.clone());
        Ok(record)
    }

    async fn read_since(&self, channel: Uuid, after: u64) -> Result<Vec<StreamEvent>, StreamError> {
        Ok(self
            .channels
            .get(&channel)
            .map(|events| events.iter().skip(after as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, _channel: Uuid, _ttl: Duration) -> Result<(), StreamError> {
        Ok(())
    }
}

// ============================================================================
// Writers and readers
// ============================================================================

/// Entry point to channels: hands out writers and reads history
#[derive(Clone)]
pub struct StreamHub {
    backend: Arc<dyn ChannelBackend>,
    store: Arc<Store>,
    ttl: Duration,
}

impl StreamHub {
    pub fn new(backend: Arc<dyn ChannelBackend>, store: Arc<Store>, ttl: Duration) -> Self {
        Self {
            backend,
            store,
            ttl,
        }
    }

    pub fn in_memory(store: Arc<Store>) -> Self {
        Self::new(Arc::new(MemoryChannels::default()), store, Duration::from_secs(3600))
    }

    pub fn channel(&self, id: Uuid, tenant_id: &str) -> StreamChannel {
        StreamChannel {
            id,
            tenant_id: tenant_id.to_string(),
            hub: self.clone(),
        }
    }

    pub async fn read_since(&self, channel: Uuid, after: u64) -> Result<Vec<StreamEvent>, StreamError> {
        self.backend.read_since(channel, after).await
    }

    /// Events users may see, oldest first
    pub async fn history(&self, channel: Uuid) -> Result<Vec<StreamEvent>, StreamError> {
        let events = self.backend.read_since(channel, 0).await?;
        Ok(events.into_iter().filter(StreamEvent::is_visible).collect())
    }
}

/// Writer of one channel
///
/// Content lines are also kept in the output store so they outlive the
/// channel's expiry.
#[derive(Clone)]
pub struct StreamChannel {
    id: Uuid,
    tenant_id: String,
    hub: StreamHub,
}

impl StreamChannel {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn write_message(&self, line: &str) -> Result<(), StreamError> {
        self.hub.store.append_output(self.id, &self.tenant_id, "STDOUT", line);
        self.hub
            .backend
            .append(self.id, EVENT_MESSAGE, json!({ "line": line }))
            .await?;
        Ok(())
    }

    pub async fn write_title(&self, title: &str) -> Result<(), StreamError> {
        self.hub
            .backend
            .append(self.id, EVENT_TITLE, json!({ "title": title }))
            .await?;
        Ok(())
    }

    pub async fn write_internal(&self, data: Value) -> Result<(), StreamError> {
        self.hub.backend.append(self.id, EVENT_INTERNAL, data).await?;
        Ok(())
    }

    /// Mark the channel finished and let it expire
    pub async fn close(&self, status: &str) -> Result<(), StreamError> {
        self.write_internal(json!({ "type": CLOSE_TYPE, "status": status }))
            .await?;
        self.hub.backend.expire(self.id, self.hub.ttl).await
    }

    /// Write a line, logging instead of failing when the channel is down
    pub async fn write_lossy(&self, line: &str) {
        if let Err(e) = self.write_message(line).await {
            tracing::warn!(channel = %self.id, "stream write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_record_carries_its_id() {
        let record = StreamEvent {
            id: 7,
            event: EVENT_MESSAGE.to_string(),
            data: json!({"line": "step 7"}),
        };
        let line = encode_record(&record).unwrap();
        let raw: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(raw, json!({"id": 7, "event": "message", "data": {"line": "step 7"}}));
        assert_eq!(decode_record(&line).unwrap(), record);

        assert!(matches!(
            decode_record(r#"{"event":"message","data":"no id"}"#),
            Err(StreamError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_records_and_history() {
        let store = Arc::new(Store::new());
        let hub = StreamHub::in_memory(store.clone());
        let id = Uuid::new_v4();
        let channel = hub.channel(id, "default");

        channel.write_title("Building").await.unwrap();
        channel.write_message("step 1").await.unwrap();
        channel.write_message("step 2").await.unwrap();
        channel.close("successful").await.unwrap();

        let all = hub.read_since(id, 0).await.unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(all[3].is_close());

        let visible = hub.history(id).await.unwrap();
        assert_eq!(visible.len(), 3);
        assert_eq!(visible[1].content_line(), Some("step 1"));

        let tail = hub.read_since(id, 2).await.unwrap();
        assert_eq!(tail[0].content_line(), Some("step 2"));

        let stored = store.output_streams.get(&id).unwrap();
        assert_eq!(stored.tail(10), vec!["step 1".to_string(), "step 2".to_string()]);
    }

    #[test]
    fn test_legacy_msg_is_content() {
        let event = StreamEvent {
            id: 1,
            event: EVENT_LEGACY_MESSAGE.into(),
            data: Value::String("hello".into()),
        };
        assert_eq!(event.content_line(), Some("hello"));
        assert_eq!(events_key(Uuid::nil()), "00000000-0000-0000-0000-000000000000:events");
    }
}
