use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::future::join_all;
use oproxy_common::ApiError;
use oproxy_core::events::LogEvent;
use oproxy_core::upstream::join_upstream_url;
use tracing::Level;

use crate::{Ctx, api_error_response};

pub async fn health(State(ctx): State<Ctx>) -> Response {
    let include_details = ctx.core.settings.public_health_details;
    build_health(&ctx, include_details).await
}

pub async fn models(State(ctx): State<Ctx>) -> Response {
    if !ctx.core.settings.public_models {
        return api_error_response(&ApiError::new(
            404,
            "Not Found",
            "invalid_request_error",
            None,
        ));
    }
    model_list(&ctx)
}

/// `{"object": "list", "data": [...]}` sorted by model id.
pub(crate) fn model_list(ctx: &Ctx) -> Response {
    let cfg = match ctx.core.config.get() {
        Ok(cfg) => cfg,
        Err(err) => return api_error_response(&ApiError::config_error(err)),
    };
    let mut ids: Vec<&String> = cfg.upstreams.keys().collect();
    ids.sort();
    let data: Vec<serde_json::Value> = ids
        .into_iter()
        .map(|id| serde_json::json!({"id": id, "object": "model", "owned_by": "proxy"}))
        .collect();
    Json(serde_json::json!({"object": "list", "data": data})).into_response()
}

/// Probes every distinct base_url once (`/health`, then `/v1/models` as the
/// OpenAI-style fallback) and aggregates to ok/degraded.
pub(crate) async fn build_health(ctx: &Ctx, include_details: bool) -> Response {
    let cfg = match ctx.core.config.get() {
        Ok(cfg) => cfg,
        Err(err) => return api_error_response(&ApiError::config_error(err)),
    };

    let mut by_upstream: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (model, upstream) in &cfg.upstreams {
        by_upstream
            .entry(upstream.base_url.clone())
            .or_default()
            .push(model.clone());
    }
    for models in by_upstream.values_mut() {
        models.sort();
    }

    let checks = by_upstream
        .into_iter()
        .map(|(base_url, models)| check_upstream(ctx, base_url, models));
    let results = join_all(checks).await;

    let mut overall_ok = true;
    let mut upstreams = serde_json::Map::new();
    for (base_url, detail, ok) in results {
        overall_ok &= ok;
        upstreams.insert(base_url, detail);
    }

    let status = if overall_ok { "ok" } else { "degraded" };
    let payload = if include_details {
        serde_json::json!({"status": status, "upstreams": upstreams})
    } else {
        serde_json::json!({"status": status})
    };
    Json(payload).into_response()
}

async fn check_upstream(
    ctx: &Ctx,
    base_url: String,
    models: Vec<String>,
) -> (String, serde_json::Value, bool) {
    let client = &ctx.core.caps_client;
    let started = Instant::now();
    let mut ok = false;
    let mut error: Option<String> = None;

    let health_url = join_upstream_url(&base_url, "/health");
    match client.get(&health_url).send().await {
        Ok(resp) if resp.status().as_u16() == 200 => ok = true,
        Ok(resp) => error = Some(format!("/health -> {}", resp.status().as_u16())),
        Err(err) => {
            error = Some(format!("/health error: {err}"));
            ctx.core.log.emit(
                LogEvent::new("public", "health_check", "error")
                    .level(Level::WARN)
                    .detail("base_url", &base_url)
                    .detail("endpoint", "/health")
                    .detail("error", err.to_string()),
            );
        }
    }

    if !ok {
        let models_url = join_upstream_url(&base_url, "/v1/models");
        match client.get(&models_url).send().await {
            Ok(resp) if resp.status().as_u16() == 200 => ok = true,
            Ok(resp) => {
                error = Some(format!(
                    "{}; /v1/models -> {}",
                    error.unwrap_or_default(),
                    resp.status().as_u16()
                ));
            }
            Err(err) => {
                error = Some(format!("{}; /v1/models error: {err}", error.unwrap_or_default()));
                ctx.core.log.emit(
                    LogEvent::new("public", "health_check", "error")
                        .level(Level::WARN)
                        .detail("base_url", &base_url)
                        .detail("endpoint", "/v1/models")
                        .detail("error", err.to_string()),
                );
            }
        }
    }

    let latency_ms = started.elapsed().as_millis() as u64;
    let detail = serde_json::json!({
        "ok": ok,
        "latency_ms": latency_ms,
        "models": models,
        "error": error,
    });
    (base_url, detail, ok)
}
