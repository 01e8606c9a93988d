use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use oproxy_common::{ApiError, Headers, header_set, is_hop_by_hop, without_hop_by_hop};
use tokio::sync::{Mutex, mpsc};
use tracing::Level;

use crate::config::Upstream;
use crate::events::LogEvent;
use crate::sniff::BodyStream;
use crate::state::AppState;
use crate::upstream::{ensure_route_supported, http_fallback_url_on_ssl_error, join_upstream_url};

/// Upstream request headers: everything except hop-by-hop and the incoming
/// `Authorization` (the proxy's own bearer must never leak upstream).
pub fn filtered_headers(incoming: &Headers, upstream: &Upstream) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("authorization") {
            continue;
        }
        out.push((name.clone(), value.clone()));
    }
    if !upstream.api_key.is_empty() {
        header_set(&mut out, "Authorization", format!("Bearer {}", upstream.api_key));
    }
    header_set(&mut out, "X-Proxy-Model", &upstream.model);
    out
}

fn response_headers(upstream_headers: &Headers, base_url: &str) -> Headers {
    let mut out = without_hop_by_hop(upstream_headers);
    header_set(&mut out, "X-Proxy-Upstream", base_url);
    out
}

/// Request body that can be handed to a second send attempt. Chunks consumed
/// by an attempt are teed into a bounded buffer; once the buffer cap is
/// passed the body flips to unsafe and may no longer be replayed.
pub struct ReplayBody {
    inner: Arc<Mutex<ReplayInner>>,
}

struct ReplayInner {
    source: BodyStream,
    buffered: Vec<Bytes>,
    buffered_bytes: usize,
    cap: usize,
    overflowed: bool,
}

impl ReplayBody {
    pub fn new(source: BodyStream, cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReplayInner {
                source,
                buffered: Vec::new(),
                buffered_bytes: 0,
                cap,
                overflowed: false,
            })),
        }
    }

    pub async fn replay_safe(&self) -> bool {
        !self.inner.lock().await.overflowed
    }

    /// A fresh pass over the body: buffered chunks first, then whatever the
    /// underlying stream still holds.
    pub fn attempt_stream(&self) -> BodyStream {
        let inner = self.inner.clone();
        stream::unfold((inner, 0usize), |(inner, pos)| async move {
            let mut guard = inner.lock().await;
            if pos < guard.buffered.len() {
                let chunk = guard.buffered[pos].clone();
                drop(guard);
                return Some((Ok(chunk), (inner, pos + 1)));
            }
            match guard.source.next().await {
                Some(Ok(chunk)) => {
                    if !guard.overflowed && guard.buffered_bytes + chunk.len() <= guard.cap {
                        guard.buffered.push(chunk.clone());
                        guard.buffered_bytes += chunk.len();
                        drop(guard);
                        Some((Ok(chunk), (inner, pos + 1)))
                    } else {
                        guard.overflowed = true;
                        guard.buffered.clear();
                        guard.buffered_bytes = 0;
                        drop(guard);
                        Some((Ok(chunk), (inner, pos)))
                    }
                }
                Some(Err(err)) => {
                    drop(guard);
                    Some((Err(err), (inner, pos)))
                }
                None => None,
            }
        })
        .boxed()
    }
}

pub struct ForwardResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: mpsc::Receiver<Bytes>,
}

/// Streams one request to its upstream and the response back. Timeouts map
/// to 504, request errors to 502 after the optional plaintext retry, and an
/// upstream 404 to the `upstream_404` envelope.
pub async fn forward(
    state: &AppState,
    upstream: &Upstream,
    method: &http::Method,
    path: &str,
    query: Option<&str>,
    incoming_headers: &Headers,
    body: ReplayBody,
) -> Result<ForwardResponse, ApiError> {
    ensure_route_supported(
        &state.caps,
        Some(&state.caps_client),
        upstream,
        path,
        &state.log,
    )
    .await?;

    let mut url = join_upstream_url(&upstream.base_url, path);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url = format!("{url}?{q}");
    }
    let headers = filtered_headers(incoming_headers, upstream);
    let wreq_method = wreq::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ApiError::upstream_request_error(format!("unsupported method {method}")))?;
    let has_body = matches!(
        *method,
        http::Method::POST | http::Method::PUT | http::Method::PATCH
    );

    let resp = match send_attempt(
        state,
        wreq_method.clone(),
        &url,
        &headers,
        has_body.then(|| body.attempt_stream()),
    )
    .await
    {
        Ok(resp) => resp,
        Err(err) if err.is_timeout() => {
            state.log.emit(
                LogEvent::new("proxy_http", "forward_request", "timeout")
                    .level(Level::WARN)
                    .detail("upstream", &upstream.base_url)
                    .detail("path", path),
            );
            return Err(ApiError::upstream_timeout(&upstream.base_url));
        }
        Err(err) => {
            let text = error_chain_text(&err);
            state.log.emit(
                LogEvent::new("proxy_http", "forward_request", "request_error")
                    .level(Level::WARN)
                    .detail("upstream", &upstream.base_url)
                    .detail("path", path)
                    .detail("error", &text),
            );
            let Some(fallback_url) = http_fallback_url_on_ssl_error(&url, &text, &state.settings)
            else {
                return Err(ApiError::upstream_request_error(text));
            };
            if has_body && !body.replay_safe().await {
                return Err(ApiError::unsafe_ssl_downgrade_retry());
            }
            match send_attempt(
                state,
                wreq_method,
                &fallback_url,
                &headers,
                has_body.then(|| body.attempt_stream()),
            )
            .await
            {
                Ok(resp) => resp,
                Err(retry_err) if retry_err.is_timeout() => {
                    state.log.emit(
                        LogEvent::new("proxy_http", "forward_request_fallback", "timeout")
                            .level(Level::WARN)
                            .detail("upstream", &upstream.base_url)
                            .detail("path", path),
                    );
                    return Err(ApiError::upstream_timeout(&upstream.base_url));
                }
                Err(retry_err) => {
                    let retry_text = error_chain_text(&retry_err);
                    state.log.emit(
                        LogEvent::new("proxy_http", "forward_request_fallback", "request_error")
                            .level(Level::WARN)
                            .detail("upstream", &upstream.base_url)
                            .detail("path", path)
                            .detail("error", &retry_text),
                    );
                    return Err(ApiError::upstream_request_error(retry_text));
                }
            }
        }
    };

    if resp.status().as_u16() == 404 {
        state.log.emit(
            LogEvent::new("proxy_http", "forward_request", "upstream_404")
                .detail("upstream", &upstream.base_url)
                .detail("path", path),
        );
        return Err(ApiError::upstream_404(path));
    }

    let status = resp.status().as_u16();
    let resp_headers = headers_from_wreq(resp.headers());
    let headers = response_headers(&resp_headers, &upstream.base_url);
    let body = stream_response(resp, state.settings.upstream_timeout);
    Ok(ForwardResponse {
        status,
        headers,
        body,
    })
}

async fn send_attempt(
    state: &AppState,
    method: wreq::Method,
    url: &str,
    headers: &Headers,
    body: Option<BodyStream>,
) -> Result<wreq::Response, wreq::Error> {
    let mut builder = state.client.request(method, url);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    if let Some(stream) = body {
        builder = builder.body(wreq::Body::wrap_stream(stream));
    }
    builder.send().await
}

/// Relays the upstream body through a channel. The pump task owns the
/// response; it ends (and closes the upstream reader) when the upstream
/// finishes, goes idle past the timeout, or the downstream receiver drops.
fn stream_response(resp: wreq::Response, idle_timeout: Duration) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let Ok(item) = next else {
                break;
            };
            let Some(item) = item else {
                break;
            };
            let Ok(chunk) = item else {
                break;
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in map {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

fn error_chain_text(err: &wreq::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
