use std::convert::Infallible;
use std::io;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use oproxy_common::{ApiError, Headers, header_get};
use oproxy_core::events::LogEvent;
use oproxy_core::forward::{ForwardResponse, ReplayBody, forward};
use oproxy_core::sniff::{SniffError, sniff_model_and_stream};
use oproxy_storage::mirror::mirror_sse_stream_default;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Level;

use crate::middleware::is_payload_too_large;
use crate::{Ctx, api_error_response};

/// Catch-all proxy entry: sniff the model, resolve the upstream, forward.
pub async fn route_and_proxy(State(ctx): State<Ctx>, req: Request) -> Response {
    let core = &ctx.core;
    let cfg = match core.config.get() {
        Ok(cfg) => cfg,
        Err(err) => return api_error_response(&ApiError::config_error(err)),
    };

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let query_model = query.as_deref().and_then(|q| query_param(q, "model"));
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let trace_id = uuid::Uuid::now_v7().to_string();

    let raw = body.into_data_stream().map_err(io::Error::other).boxed();
    let sniffed = sniff_model_and_stream(
        query_model,
        content_type.as_deref(),
        raw,
        core.settings.sniff_bytes,
    )
    .await;
    let (model, body_stream) = match sniffed {
        Ok(found) => found,
        Err(err @ SniffError::NotFound) => {
            core.log.emit(
                LogEvent::new("proxy", "route_request", "model_not_found")
                    .detail("trace_id", &trace_id)
                    .detail("path", &path)
                    .detail("error", err.to_string()),
            );
            return api_error_response(&ApiError::model_not_found(err.to_string()));
        }
        Err(SniffError::Read(err)) => {
            if is_payload_too_large(&err) {
                core.log.emit(
                    LogEvent::new("middleware", "body_size_limit", "payload_too_large")
                        .level(Level::WARN)
                        .detail("trace_id", &trace_id)
                        .detail("path", &path),
                );
                return api_error_response(&ApiError::payload_too_large());
            }
            return api_error_response(&ApiError::new(
                400,
                format!("Failed to read request body: {err}"),
                "invalid_request_error",
                None,
            ));
        }
    };

    let Some(upstream) = cfg.upstreams.get(&model) else {
        core.log.emit(
            LogEvent::new("proxy", "route_request", "unknown_model")
                .detail("trace_id", &trace_id)
                .detail("model", &model)
                .detail("path", &path),
        );
        return api_error_response(&ApiError::unknown_model(&model));
    };
    core.log.emit(
        LogEvent::new("proxy", "route_request", "upstream_selected")
            .detail("trace_id", &trace_id)
            .detail("model", &model)
            .detail("upstream", &upstream.base_url)
            .detail("path", &path),
    );

    let incoming_headers = headers_to_vec(&parts.headers);
    let replay = ReplayBody::new(body_stream, core.settings.fallback_buffer_bytes);
    let forwarded = match forward(
        core,
        upstream,
        &parts.method,
        &path,
        query.as_deref(),
        &incoming_headers,
        replay,
    )
    .await
    {
        Ok(resp) => resp,
        Err(err) => return api_error_response(&err),
    };

    let ForwardResponse {
        status,
        headers,
        mut body,
    } = forwarded;

    // Mirror streamed /v1/responses completions into the stream log when a
    // key is supplied, so a second consumer can replay them.
    if path == "/v1/responses" && query_flag(query.as_deref(), "stream") {
        if let Some(log_client) = ctx.stream_log.clone()
            && let Some(stream_key) = header_get(&incoming_headers, "x-stream-key")
        {
            body = mirror_sse_stream_default(body, log_client, stream_key.to_string());
        }
    }

    streaming_response(status, &headers, body)
}

pub(crate) fn query_param(query: &str, name: &str) -> Option<String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

fn query_flag(query: Option<&str>, name: &str) -> bool {
    query
        .and_then(|q| query_param(q, name))
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub(crate) fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

fn is_framing_header(name: &str) -> bool {
    // Hyper sets framing itself; hop-by-hop headers were already dropped.
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

fn streaming_response(
    status: u16,
    headers: &Headers,
    body: tokio::sync::mpsc::Receiver<Bytes>,
) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(out) = builder.headers_mut() {
        for (name, value) in headers {
            if is_framing_header(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                out.append(name, value);
            }
        }
    }
    let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| api_error_response(&ApiError::upstream_request_error("response build failed")))
}
