use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures_util::{StreamExt, future};
use oproxy_common::ApiError;
use oproxy_storage::replay::replay_stream_default;
use tracing::warn;

use crate::{Ctx, api_error_response, public};

/// Like `/health`, but always with per-upstream details.
pub async fn health(State(ctx): State<Ctx>) -> Response {
    public::build_health(&ctx, true).await
}

/// Model list regardless of `PUBLIC_MODELS`.
pub async fn models(State(ctx): State<Ctx>) -> Response {
    public::model_list(&ctx)
}

/// Replays a mirrored completion from the stream log as SSE, in append
/// order, until the terminal marker.
pub async fn stream_replay(State(ctx): State<Ctx>, Path(stream_key): Path<String>) -> Response {
    let Some(log) = ctx.stream_log.clone() else {
        return api_error_response(&ApiError::client_missing(
            "Stream log client is not configured",
        ));
    };

    let key = stream_key.clone();
    let frames = replay_stream_default(log, stream_key)
        .take_while(move |item| {
            if let Err(err) = item {
                warn!(event = "stream_replay_error", stream_key = %key, error = %err);
            }
            future::ready(item.is_ok())
        })
        .map(|item| {
            let value = item.unwrap_or_default();
            Ok::<_, Infallible>(Bytes::from(format!("data: {value}\n\n")))
        });

    let builder = Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        // Hint common reverse proxies to avoid buffering SSE responses.
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no");
    builder
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| api_error_response(&ApiError::upstream_request_error("response build failed")))
}
