use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::stream_log::{StreamLog, TERMINAL_MAXLEN};

/// Incremental UTF-8 decoder that carries a trailing partial code point into
/// the next chunk instead of emitting a replacement character for it.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &data;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            // Incomplete trailing code point: hold it back.
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes whatever is still pending at end of stream.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            String::new()
        } else {
            String::from_utf8_lossy(&pending).into_owned()
        }
    }
}

async fn append(log: &dyn StreamLog, key: &str, payload: serde_json::Value) {
    let raw = payload.to_string();
    if let Err(err) = log.xadd(key, &raw).await {
        // Log writes must never interrupt the byte stream to the client.
        warn!(
            event = "mirror_write_error",
            stream_key = %key,
            error = %err
        );
    }
}

/// Tees an SSE byte stream into the stream log. The bytes delivered
/// downstream are exactly the upstream bytes, sent before the log write so a
/// slow log never delays the client. After the upstream ends (or the client
/// goes away), the decoder tail is flushed, the terminal `{"done": true}`
/// entry is appended, and the stream is trimmed exactly once.
pub fn mirror_sse_stream(
    mut upstream: mpsc::Receiver<Bytes>,
    log: Arc<dyn StreamLog>,
    stream_key: String,
    terminal_maxlen: u64,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut decoder = Utf8Carry::default();
        while let Some(chunk) = upstream.recv().await {
            let client_gone = tx.send(chunk.clone()).await.is_err();
            if client_gone {
                break;
            }
            let decoded = decoder.decode(&chunk);
            if !decoded.is_empty() {
                append(log.as_ref(), &stream_key, serde_json::json!({"chunk": decoded})).await;
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            append(log.as_ref(), &stream_key, serde_json::json!({"chunk": tail})).await;
        }
        append(log.as_ref(), &stream_key, serde_json::json!({"done": true})).await;
        if let Err(err) = log.xtrim(&stream_key, terminal_maxlen).await {
            warn!(
                event = "mirror_trim_error",
                stream_key = %stream_key,
                error = %err
            );
        }
    });
    rx
}

/// Mirror with the default terminal trim bound.
pub fn mirror_sse_stream_default(
    upstream: mpsc::Receiver<Bytes>,
    log: Arc<dyn StreamLog>,
    stream_key: String,
) -> mpsc::Receiver<Bytes> {
    mirror_sse_stream(upstream, log, stream_key, TERMINAL_MAXLEN)
}
