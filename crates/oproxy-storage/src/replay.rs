use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::stream;

use crate::stream_log::{StreamEntry, StreamLog, StreamLogError};

pub const REPLAY_START_ID: &str = "0-0";
pub const REPLAY_BLOCK_MS: u64 = 15_000;
pub const REPLAY_COUNT: usize = 100;

struct ReplayState {
    log: Arc<dyn StreamLog>,
    key: String,
    last_id: String,
    block_ms: u64,
    count: usize,
    pending: VecDeque<StreamEntry>,
    done: bool,
}

/// Replays a stream log in append order as JSON objects, blocking on the log
/// for new entries, until the terminal `{"done": true}` entry is seen.
pub fn replay_stream(
    log: Arc<dyn StreamLog>,
    key: String,
    last_id: String,
    block_ms: u64,
    count: usize,
) -> impl Stream<Item = Result<serde_json::Value, StreamLogError>> + Send {
    let state = ReplayState {
        log,
        key,
        last_id,
        block_ms,
        count,
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            while let Some(entry) = state.pending.pop_front() {
                // Advance past malformed entries too, or a bad record would
                // be re-read forever.
                state.last_id = entry.id;
                let Some(raw) = entry.json else {
                    continue;
                };
                let item = match serde_json::from_str::<serde_json::Value>(&raw) {
                    Ok(item) => item,
                    Err(_) => continue,
                };
                if item.get("done") == Some(&serde_json::Value::Bool(true)) {
                    state.done = true;
                }
                return Some((Ok(item), state));
            }

            match state
                .log
                .xread(&state.key, &state.last_id, state.block_ms, state.count)
                .await
            {
                Ok(rows) => state.pending.extend(rows),
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }
        }
    })
}

/// Replay with the reader defaults: from the beginning, 15 s block, 100 per
/// read.
pub fn replay_stream_default(
    log: Arc<dyn StreamLog>,
    key: String,
) -> impl Stream<Item = Result<serde_json::Value, StreamLogError>> + Send {
    replay_stream(
        log,
        key,
        REPLAY_START_ID.to_string(),
        REPLAY_BLOCK_MS,
        REPLAY_COUNT,
    )
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use crate::memory::MemoryStreamLog;
    use crate::stream_log::StreamLog as _;

    use super::*;

    #[tokio::test]
    async fn yields_in_order_and_stops_at_done() {
        let log = Arc::new(MemoryStreamLog::new());
        log.xadd("k", r#"{"chunk":"a"}"#).await.unwrap();
        log.xadd("k", r#"{"chunk":"b"}"#).await.unwrap();
        log.xadd("k", r#"{"done":true}"#).await.unwrap();
        log.xadd("k", r#"{"chunk":"never"}"#).await.unwrap();

        let items: Vec<_> = replay_stream(log, "k".to_string(), REPLAY_START_ID.to_string(), 50, 2)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            items,
            vec![
                serde_json::json!({"chunk":"a"}),
                serde_json::json!({"chunk":"b"}),
                serde_json::json!({"done":true}),
            ]
        );
    }

    #[tokio::test]
    async fn waits_for_entries_appended_later() {
        let log = Arc::new(MemoryStreamLog::new());
        let reader = tokio::spawn({
            let log = log.clone();
            async move {
                replay_stream(log, "k".to_string(), REPLAY_START_ID.to_string(), 5_000, 100)
                    .map(|r| r.unwrap())
                    .collect::<Vec<_>>()
                    .await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        log.xadd("k", r#"{"chunk":"late"}"#).await.unwrap();
        log.xadd("k", r#"{"done":true}"#).await.unwrap();

        let items = reader.await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], serde_json::json!({"chunk":"late"}));
    }

    #[tokio::test]
    async fn malformed_entries_advance_the_cursor() {
        let log = Arc::new(MemoryStreamLog::new());
        // Entries a crashed writer could leave behind: no json field, then
        // unparseable json. Both must advance last_id without being yielded.
        log.push_raw("k", None);
        log.push_raw("k", Some("{not json".to_string()));
        log.xadd("k", r#"{"done":true}"#).await.unwrap();

        let items: Vec<_> =
            replay_stream(log, "k".to_string(), REPLAY_START_ID.to_string(), 50, 100)
                .map(|r| r.unwrap())
                .collect()
                .await;
        assert_eq!(items, vec![serde_json::json!({"done":true})]);
    }
}
