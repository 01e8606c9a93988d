use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

/// Streams trimmed to roughly this many entries once their terminal marker
/// is written. Live streams are never trimmed: trimming while producers are
/// still writing can evict unread IDs and break consumers that read strictly
/// by `last_id`.
pub const TERMINAL_MAXLEN: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StreamLogError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One log record: an opaque monotonically increasing id plus the raw `json`
/// field (absent on malformed entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub json: Option<String>,
}

/// The `XADD`/`XREAD`/`XTRIM` contract shared by the SSE mirror and the
/// replay reader.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Appends `{json: payload}` and returns the assigned entry id.
    async fn xadd(&self, key: &str, payload: &str) -> Result<String, StreamLogError>;

    /// Reads entries after `last_id`, blocking up to `block_ms` for new ones.
    /// An empty result means the block timed out.
    async fn xread(
        &self,
        key: &str,
        last_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamLogError>;

    /// Approximate trim to `maxlen` entries.
    async fn xtrim(&self, key: &str, maxlen: u64) -> Result<u64, StreamLogError>;
}

/// Redis Streams implementation over a multiplexed connection.
#[derive(Clone)]
pub struct RedisStreamLog {
    manager: ConnectionManager,
}

impl RedisStreamLog {
    pub async fn connect(url: &str) -> Result<Self, StreamLogError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn xadd(&self, key: &str, payload: &str) -> Result<String, StreamLogError> {
        let mut conn = self.manager.clone();
        let id: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg("json")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn xread(
        &self,
        key: &str,
        last_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let mut conn = self.manager.clone();
        // Nil reply (block timeout) decodes as None.
        type Reply = Option<Vec<(String, Vec<(String, HashMap<String, String>)>)>>;
        let rows: Reply = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(key)
            .arg(last_id)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::new();
        for (_stream, rows) in rows.unwrap_or_default() {
            for (id, mut fields) in rows {
                entries.push(StreamEntry {
                    id,
                    json: fields.remove("json"),
                });
            }
        }
        Ok(entries)
    }

    async fn xtrim(&self, key: &str, maxlen: u64) -> Result<u64, StreamLogError> {
        let mut conn = self.manager.clone();
        let trimmed: u64 = redis::cmd("XTRIM")
            .arg(key)
            .arg("MAXLEN")
            .arg("~")
            .arg(maxlen)
            .query_async(&mut conn)
            .await?;
        Ok(trimmed)
    }
}
