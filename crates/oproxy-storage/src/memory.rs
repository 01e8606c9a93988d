use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::stream_log::{StreamEntry, StreamLog, StreamLogError};

/// In-process stream log with Redis-Stream ordering semantics. Used by tests
/// and as a stand-in when no Redis is wired up in a harness.
#[derive(Default)]
pub struct MemoryStreamLog {
    entries: Mutex<HashMap<String, Vec<StreamEntry>>>,
    trims: Mutex<Vec<(String, u64)>>,
    seq: AtomicU64,
    notify: Notify,
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, key: &str) -> Vec<StreamEntry> {
        self.entries
            .lock()
            .map(|map| map.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn trims(&self) -> Vec<(String, u64)> {
        self.trims.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Appends an entry verbatim, `json` field included or not. Lets tests
    /// seed the malformed records a crashed writer can leave behind.
    pub fn push_raw(&self, key: &str, json: Option<String>) -> String {
        let id = format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(key.to_string()).or_default().push(StreamEntry {
                id: id.clone(),
                json,
            });
        }
        self.notify.notify_waiters();
        id
    }
}

fn parse_id(id: &str) -> (u64, u64) {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn xadd(&self, key: &str, payload: &str) -> Result<String, StreamLogError> {
        let id = format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(key.to_string()).or_default().push(StreamEntry {
                id: id.clone(),
                json: Some(payload.to_string()),
            });
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn xread(
        &self,
        key: &str,
        last_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let after = parse_id(last_id);
        loop {
            let notified = self.notify.notified();
            let pending: Vec<StreamEntry> = self
                .entries
                .lock()
                .map(|map| {
                    map.get(key)
                        .map(|rows| {
                            rows.iter()
                                .filter(|row| parse_id(&row.id) > after)
                                .take(count)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            if !pending.is_empty() {
                return Ok(pending);
            }
            if tokio::time::timeout(Duration::from_millis(block_ms), notified)
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn xtrim(&self, key: &str, maxlen: u64) -> Result<u64, StreamLogError> {
        if let Ok(mut trims) = self.trims.lock() {
            trims.push((key.to_string(), maxlen));
        }
        let mut removed = 0;
        if let Ok(mut entries) = self.entries.lock()
            && let Some(rows) = entries.get_mut(key)
            && rows.len() as u64 > maxlen
        {
            removed = rows.len() as u64 - maxlen;
            rows.drain(..removed as usize);
        }
        Ok(removed)
    }
}
