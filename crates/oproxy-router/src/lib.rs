use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::from_fn_with_state;
use axum::response::Response;
use axum::routing::{any, get, post};
use oproxy_common::ApiError;
use oproxy_core::AppState;
use oproxy_storage::StreamLog;

pub mod internal;
pub mod middleware;
pub mod proxy;
pub mod public;
pub mod realtime;

pub use middleware::RateLimiter;

/// Routes registered explicitly; everything else falls through to the
/// catch-all so new backend endpoints pass without a proxy release.
pub const PROXY_PATHS: [&str; 14] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/responses",
    "/v1/audio/transcriptions",
    "/v1/audio/translations",
    "/tokenize",
    "/detokenize",
    "/pooling",
    "/classify",
    "/score",
    "/rerank",
    "/v1/rerank",
    "/v2/rerank",
];

#[derive(Clone)]
pub struct Ctx {
    pub core: Arc<AppState>,
    pub stream_log: Option<Arc<dyn StreamLog>>,
    pub limiter: Arc<RateLimiter>,
}

impl Ctx {
    pub fn new(core: Arc<AppState>, stream_log: Option<Arc<dyn StreamLog>>) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            core.settings.rate_limit_rps,
            core.settings.rate_limit_capacity(),
        ));
        Self {
            core,
            stream_log,
            limiter,
        }
    }
}

pub fn router(ctx: Ctx) -> Router {
    let mut router = Router::new()
        .route("/health", get(public::health))
        .route("/v1/models", get(public::models))
        .route("/internal/health", get(internal::health))
        .route("/internal/v1/models", get(internal::models))
        .route("/internal/streams/{stream_key}", get(internal::stream_replay))
        .route("/v1/realtime", any(realtime::realtime));
    for path in PROXY_PATHS {
        router = router.route(path, post(proxy::route_and_proxy));
    }
    router
        .fallback(proxy::route_and_proxy)
        .layer(from_fn_with_state(ctx.clone(), middleware::body_limit))
        .layer(from_fn_with_state(ctx.clone(), middleware::bearer_auth))
        .layer(from_fn_with_state(ctx.clone(), middleware::rate_limit))
        .with_state(ctx)
}

pub(crate) fn api_error_response(err: &ApiError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = Response::new(Body::from(err.to_body()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}
