use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::middleware::Next;
use axum::response::Response;
use futures_util::StreamExt;
use futures_util::future;
use oproxy_common::ApiError;
use oproxy_core::events::LogEvent;
use tracing::Level;

use crate::{Ctx, api_error_response};

/// Marker for a body stream cut off by the size limiter; downstream readers
/// detect it in the error source chain and answer 413.
#[derive(Debug, thiserror::Error)]
#[error("request body exceeds the configured limit")]
pub struct PayloadTooLarge;

pub fn is_payload_too_large(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = current {
        if err.is::<PayloadTooLarge>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Rejects oversized bodies. A declared `Content-Length` over the cap is a
/// straight 413; without the header, a counting wrapper fails the stream the
/// moment the running total would pass the cap, never buffering the body.
pub async fn body_limit(State(ctx): State<Ctx>, req: Request, next: Next) -> Response {
    let max = ctx.core.settings.max_body_bytes;
    if let Some(declared) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        && declared > max
    {
        ctx.core.log.emit(
            LogEvent::new("middleware", "body_size_limit", "payload_too_large")
                .level(Level::WARN)
                .detail("max_bytes", max.to_string()),
        );
        return api_error_response(&ApiError::payload_too_large());
    }

    let (parts, body) = req.into_parts();
    let counted = body
        .into_data_stream()
        .map(|item| item.map_err(axum::BoxError::from))
        .scan((0u64, false), move |(seen, failed), item| {
            if *failed {
                return future::ready(None);
            }
            let out = match item {
                Ok(chunk) => {
                    *seen += chunk.len() as u64;
                    if *seen > max {
                        *failed = true;
                        Err(axum::BoxError::from(PayloadTooLarge))
                    } else {
                        Ok(chunk)
                    }
                }
                Err(err) => {
                    *failed = true;
                    Err(err)
                }
            };
            future::ready(Some(out))
        });
    let req = Request::from_parts(parts, Body::from_stream(counted));
    next.run(req).await
}

const AUTH_EXEMPT: [&str; 4] = ["/docs", "/openapi.json", "/health", "/v1/models"];

pub fn bearer_ok(header: Option<&HeaderValue>, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let Some(value) = header.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match value.strip_prefix("Bearer ") {
        Some(rest) => rest.trim() == token,
        None => false,
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub async fn bearer_auth(State(ctx): State<Ctx>, req: Request, next: Next) -> Response {
    let settings = &ctx.core.settings;
    if !settings.auth_required {
        return next.run(req).await;
    }
    let path = req.uri().path();
    if AUTH_EXEMPT.contains(&path) || path.starts_with("/docs/") {
        return next.run(req).await;
    }
    // CORS preflight.
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    // WebSocket handshakes are answered with a close frame (4401) by the
    // realtime handler, not an HTTP 401.
    if is_websocket_upgrade(req.headers()) {
        return next.run(req).await;
    }
    if bearer_ok(req.headers().get(header::AUTHORIZATION), &settings.bearer_token) {
        next.run(req).await
    } else {
        api_error_response(&ApiError::unauthorized())
    }
}

struct Bucket {
    last_refill: Instant,
    tokens: f64,
}

/// Per-client token buckets. Idle entries are evicted opportunistically once
/// the map grows past a threshold, so the map stays bounded.
pub struct RateLimiter {
    rps: f64,
    cap: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

const EVICT_SCAN_THRESHOLD: usize = 1024;

impl RateLimiter {
    pub fn new(rps: f64, cap: f64) -> Self {
        Self {
            rps,
            cap,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.rps > 0.0
    }

    pub fn try_acquire(&self, key: &str, now: Instant) -> bool {
        let Ok(mut buckets) = self.buckets.lock() else {
            return true;
        };
        if buckets.len() > EVICT_SCAN_THRESHOLD {
            // A bucket untouched for cap/rps seconds has fully refilled and
            // carries no state worth keeping.
            let idle = Duration::from_secs_f64(self.cap / self.rps);
            buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < idle);
        }
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            last_refill: now,
            tokens: self.cap,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.cap);
        bucket.last_refill = now;
        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }
}

fn client_key(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(State(ctx): State<Ctx>, req: Request, next: Next) -> Response {
    if !ctx.limiter.enabled() {
        return next.run(req).await;
    }
    let key = client_key(&req);
    if ctx.limiter.try_acquire(&key, Instant::now()) {
        return next.run(req).await;
    }
    ctx.core.log.emit(
        LogEvent::new("middleware", "rate_limit", "hit")
            .level(Level::WARN)
            .detail("client", &key)
            .detail("path", req.uri().path()),
    );
    api_error_response(&ApiError::rate_limited())
}
