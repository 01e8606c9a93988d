use std::io;
use std::sync::LazyLock;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use regex::bytes::Regex;

/// Body chunks as they flow through the proxy.
pub type BodyStream = BoxStream<'static, Result<Bytes, io::Error>>;

static JSON_MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""model"\s*:\s*"([^"\\]+)""#).unwrap());
static MULTIPART_MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="model"\r\n\r\n([^\r\n]+)"#).unwrap());

#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    #[error("Model is not found in request body (sniff limit exceeded or missing).")]
    NotFound,
    #[error("read request body: {0}")]
    Read(#[from] io::Error),
}

/// Extracts the routing model from the query string or a bounded prefix of
/// the body, and returns a stream that replays the entire body byte-for-byte.
pub async fn sniff_model_and_stream(
    query_model: Option<String>,
    content_type: Option<&str>,
    mut body: BodyStream,
    limit: usize,
) -> Result<(String, BodyStream), SniffError> {
    if let Some(model) = query_model.filter(|m| !m.is_empty()) {
        return Ok((model, body));
    }

    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    let mut seen: Vec<Bytes> = Vec::new();
    let mut prefix: Vec<u8> = Vec::new();
    let mut model: Option<String> = None;

    while let Some(item) = body.next().await {
        let chunk = item?;
        if chunk.is_empty() {
            continue;
        }
        seen.push(chunk.clone());
        if prefix.len() < limit {
            let take = (limit - prefix.len()).min(chunk.len());
            prefix.extend_from_slice(&chunk[..take]);
        }
        model = extract_model_from_prefix(&prefix, &content_type);
        if model.is_some() || prefix.len() >= limit {
            break;
        }
    }

    let Some(model) = model else {
        return Err(SniffError::NotFound);
    };
    let replay = stream::iter(seen.into_iter().map(Ok)).chain(body).boxed();
    Ok((model, replay))
}

fn extract_model_from_prefix(prefix: &[u8], content_type: &str) -> Option<String> {
    if content_type.contains("multipart/form-data") {
        return MULTIPART_MODEL_RE
            .captures(prefix)
            .map(|c| String::from_utf8_lossy(&c[1]).trim().to_string());
    }
    // JSON, +json suffixes, and mislabeled clients all get the JSON regex.
    JSON_MODEL_RE
        .captures(prefix)
        .map(|c| String::from_utf8_lossy(&c[1]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&[u8]]) -> BodyStream {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::copy_from_slice(p)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn collect(body: BodyStream) -> Vec<u8> {
        body.map(|c| c.unwrap().to_vec()).concat().await
    }

    #[tokio::test]
    async fn json_body_yields_model_and_identical_bytes() {
        let body = br#"{"model":"m1","messages":[]}"#;
        let (model, replay) = sniff_model_and_stream(
            None,
            Some("application/json"),
            chunks(&[&body[..10], &body[10..]]),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(model, "m1");
        assert_eq!(collect(replay).await, body.to_vec());
    }

    #[tokio::test]
    async fn query_model_wins_and_passes_body_through() {
        let body = b"opaque bytes, not json";
        let (model, replay) = sniff_model_and_stream(
            Some("qp-model".to_string()),
            Some("application/octet-stream"),
            chunks(&[body]),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(model, "qp-model");
        assert_eq!(collect(replay).await, body.to_vec());
    }

    #[tokio::test]
    async fn multipart_field_is_extracted() {
        let body = b"--xyz\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--xyz--\r\n";
        let (model, _replay) = sniff_model_and_stream(
            None,
            Some("multipart/form-data; boundary=xyz"),
            chunks(&[body]),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(model, "whisper-1");
    }

    #[tokio::test]
    async fn mislabeled_content_type_falls_back_to_json_regex() {
        let body = br#"{"model": "m2"}"#;
        let (model, _replay) =
            sniff_model_and_stream(None, Some("text/plain"), chunks(&[body]), 1024)
                .await
                .unwrap();
        assert_eq!(model, "m2");
    }

    #[tokio::test]
    async fn model_past_the_sniff_limit_is_not_found() {
        // 2 MiB of whitespace padding before the model field, 1 MiB limit.
        let mut body = vec![b' '; 2 * 1024 * 1024];
        body.extend_from_slice(br#"{"model":"late"}"#);
        let err = sniff_model_and_stream(
            None,
            Some("application/json"),
            chunks(&[&body]),
            1024 * 1024,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SniffError::NotFound));
    }

    #[tokio::test]
    async fn first_model_occurrence_wins() {
        let body = br#"{"model":"first","nested":{"model":"second"}}"#;
        let (model, _replay) =
            sniff_model_and_stream(None, Some("application/json"), chunks(&[body]), 1024)
                .await
                .unwrap();
        assert_eq!(model, "first");
    }

    #[tokio::test]
    async fn escaped_value_is_not_matched_short() {
        // The regex must not stop at an escape sequence and return a
        // truncated value; this body simply has no clean match.
        let body = br#"{"model":"bad\"}"#;
        let err = sniff_model_and_stream(None, Some("application/json"), chunks(&[body]), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::NotFound));
    }
}
