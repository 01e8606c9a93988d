use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use oproxy_common::ApiError;
use url::Url;

use crate::config::Upstream;
use crate::events::{ActionLog, LogEvent};
use crate::settings::Settings;

/// Paths every OpenAI-compatible backend is assumed to serve when its
/// OpenAPI document could not be discovered.
const OPENAI_ALLOWLIST: [&str; 6] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/models",
    "/v1/responses",
    "/v1/images/generations",
];

const DEEPINFRA_ALLOWLIST: [&str; 6] = OPENAI_ALLOWLIST;

/// Joins a base URL and an incoming path, de-duplicating the `/v1` segment
/// for bases that already end in `/v1` or `/v1/openai`.
pub fn join_upstream_url(base_url: &str, incoming_path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = if incoming_path.starts_with('/') {
        incoming_path.to_string()
    } else {
        format!("/{incoming_path}")
    };
    let path = if (base.ends_with("/v1") || base.ends_with("/v1/openai")) && path.starts_with("/v1/")
    {
        path["/v1".len()..].to_string()
    } else {
        path
    };
    format!("{base}{path}")
}

/// The OpenAPI path set of one upstream; `None` when discovery failed.
#[derive(Debug, Clone, Default)]
pub struct UpstreamCaps {
    pub paths: Option<HashSet<String>>,
}

pub struct CapsCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, UpstreamCaps)>>,
}

impl CapsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        upstream: &Upstream,
        client: Option<&wreq::Client>,
        log: &ActionLog,
    ) -> UpstreamCaps {
        if let Ok(entries) = self.entries.lock()
            && let Some((stored_at, caps)) = entries.get(&upstream.base_url)
            && stored_at.elapsed() < self.ttl
        {
            return caps.clone();
        }
        // Concurrent discoveries for the same key are acceptable; last write
        // wins and the cache stays consistent.
        let caps = self.discover(upstream, client, log).await;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(upstream.base_url.clone(), (Instant::now(), caps.clone()));
        }
        caps
    }

    async fn discover(
        &self,
        upstream: &Upstream,
        client: Option<&wreq::Client>,
        log: &ActionLog,
    ) -> UpstreamCaps {
        let Some(client) = client else {
            log.emit(
                LogEvent::new("upstream", "discover_caps", "client_missing")
                    .detail("upstream", &upstream.base_url),
            );
            return UpstreamCaps::default();
        };

        let url = join_upstream_url(&upstream.base_url, "/openapi.json");
        let mut req = client.get(&url);
        if !upstream.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", upstream.api_key));
        }
        match req.send().await {
            Ok(resp) if resp.status().as_u16() == 200 => {
                let body = match resp.bytes().await {
                    Ok(body) => body,
                    Err(err) => {
                        log.emit(
                            LogEvent::new("upstream", "discover_caps", "error")
                                .detail("upstream", &upstream.base_url)
                                .detail("error", err.to_string()),
                        );
                        return UpstreamCaps::default();
                    }
                };
                match serde_json::from_slice::<serde_json::Value>(&body) {
                    Ok(doc) => {
                        let paths = doc
                            .get("paths")
                            .and_then(|p| p.as_object())
                            .map(|p| p.keys().cloned().collect::<HashSet<_>>())
                            .unwrap_or_default();
                        UpstreamCaps { paths: Some(paths) }
                    }
                    Err(err) => {
                        log.emit(
                            LogEvent::new("upstream", "discover_caps", "error")
                                .detail("upstream", &upstream.base_url)
                                .detail("error", err.to_string()),
                        );
                        UpstreamCaps::default()
                    }
                }
            }
            Ok(_) => UpstreamCaps::default(),
            Err(err) => {
                log.emit(
                    LogEvent::new("upstream", "discover_caps", "error")
                        .detail("upstream", &upstream.base_url)
                        .detail("error", err.to_string()),
                );
                UpstreamCaps::default()
            }
        }
    }
}

/// Preflight: reject a route the upstream is known (or assumed) not to serve.
pub async fn ensure_route_supported(
    cache: &CapsCache,
    client: Option<&wreq::Client>,
    upstream: &Upstream,
    incoming_path: &str,
    log: &ActionLog,
) -> Result<(), ApiError> {
    let caps = cache.get(upstream, client, log).await;
    if let Some(paths) = caps.paths {
        if paths.contains(incoming_path) {
            return Ok(());
        }
        return Err(ApiError::route_not_found(incoming_path));
    }
    match provider_allowlist(upstream) {
        Some(allow) if !allow.contains(&incoming_path) => {
            Err(ApiError::route_not_found(incoming_path))
        }
        // No allow-list for this provider: defer to the upstream's own 404.
        _ => Ok(()),
    }
}

fn provider_allowlist(upstream: &Upstream) -> Option<&'static [&'static str]> {
    let base = upstream.base_url.to_ascii_lowercase();
    if base.contains("deepinfra") {
        return Some(&DEEPINFRA_ALLOWLIST);
    }
    if base.contains(":11434") || base.contains("ollama") {
        return Some(&OPENAI_ALLOWLIST);
    }
    None
}

const SSL_ERROR_MARKERS: [&str; 4] = [
    "record layer failure",
    "wrong version number",
    "tlsv1 alert",
    "ssl",
];

/// When a local backend is misconfigured as HTTPS but speaks plaintext, the
/// request may be retried once over `http://`. Returns the rewritten URL when
/// every precondition holds.
pub fn http_fallback_url_on_ssl_error(url: &str, error: &str, settings: &Settings) -> Option<String> {
    if !settings.allow_ssl_downgrade {
        return None;
    }
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }
    let host = parsed.host_str()?;
    if !settings.downgrade_host_allowed(host) {
        return None;
    }
    let msg = error.to_ascii_lowercase();
    if !SSL_ERROR_MARKERS.iter().any(|marker| msg.contains(marker)) {
        return None;
    }
    let mut downgraded = parsed;
    downgraded.set_scheme("http").ok()?;
    Some(downgraded.to_string())
}
