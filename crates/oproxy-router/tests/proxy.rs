use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use oproxy_core::Settings;
use oproxy_core::bootstrap::bootstrap_with_settings;
use oproxy_router::Ctx;
use oproxy_storage::{MemoryStreamLog, StreamLog};

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct UpstreamState {
    captured: Arc<Mutex<Vec<Captured>>>,
}

async fn upstream_any(State(state): State<UpstreamState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    state.captured.lock().unwrap().push(Captured {
        path: parts.uri.path().to_string(),
        headers,
        body: bytes.to_vec(),
    });

    match parts.uri.path() {
        "/health" => Json(serde_json::json!({"status": "ok"})).into_response(),
        "/v1/models" => {
            Json(serde_json::json!({"object": "list", "data": []})).into_response()
        }
        "/openapi.json" | "/v1/embeddings" => StatusCode::NOT_FOUND.into_response(),
        "/v1/responses" => sse_response(),
        _ => Json(serde_json::json!({"ok": true})).into_response(),
    }
}

/// A smiley split across two frames, with a pause so the chunk boundary
/// survives the TCP hop.
fn sse_response() -> Response {
    let stream = futures_util::stream::unfold(0u8, |i| async move {
        match i {
            0 => Some((
                Ok::<Bytes, Infallible>(Bytes::from_static(b"data: \xF0\x9F")),
                1,
            )),
            1 => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Ok(Bytes::from_static(b"\x99\x82\n\n")), 2))
            }
            _ => None,
        }
    });
    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn spawn_upstream() -> (String, UpstreamState) {
    let state = UpstreamState::default();
    let app = axum::Router::new()
        .fallback(upstream_any)
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

async fn spawn_proxy(
    models: &[(&str, &str, &str)],
    stream_log: Option<Arc<MemoryStreamLog>>,
    tweak: impl FnOnce(&mut Settings),
) -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.yml");
    let mut yaml = String::from("models:\n");
    for (model, base_url, api_key) in models {
        yaml.push_str(&format!(
            "  - {{ model: \"{model}\", base_url: \"{base_url}\", api_key: \"{api_key}\" }}\n"
        ));
    }
    std::fs::write(&path, yaml).unwrap();

    let mut settings = Settings {
        auth_required: false,
        config_path: path,
        ..Settings::default()
    };
    tweak(&mut settings);

    let boot = bootstrap_with_settings(settings).await.unwrap();
    let ctx = Ctx::new(
        boot.state,
        stream_log.map(|log| log as Arc<dyn StreamLog>),
    );
    let app = oproxy_router::router(ctx).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), dir)
}

fn http_client() -> wreq::Client {
    wreq::Client::builder().build().unwrap()
}

fn header<'a>(captured: &'a Captured, name: &str) -> Option<&'a str> {
    captured
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn sniffs_model_and_forwards_exact_body() {
    let (upstream_url, upstream) = spawn_upstream().await;
    let (proxy_url, _dir) =
        spawn_proxy(&[("m1", upstream_url.as_str(), "sk-up")], None, |_| {}).await;

    let body = br#"{"model":"m1","messages":[]}"#;
    let resp = http_client()
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .header("authorization", "Bearer downstream-secret")
        .body(body.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("x-proxy-upstream")
            .and_then(|v| v.to_str().ok()),
        Some(upstream_url.as_str())
    );

    let captured = upstream.captured.lock().unwrap();
    let call = captured
        .iter()
        .find(|c| c.path == "/v1/chat/completions")
        .expect("upstream was called");
    assert_eq!(call.body, body.to_vec());
    assert_eq!(header(call, "x-proxy-model"), Some("m1"));
    // The proxy's own bearer is replaced by the upstream key.
    assert_eq!(header(call, "authorization"), Some("Bearer sk-up"));
}

#[tokio::test]
async fn unknown_and_missing_models_map_to_400() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) =
        spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |_| {}).await;
    let client = http_client();

    let resp = client
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(br#"{"model":"nope"}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let envelope: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(envelope["error"]["code"], "unknown_model");

    let resp = client
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(br#"{"messages":[]}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let envelope: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(envelope["error"]["code"], "model_not_found");
    assert_eq!(envelope["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn upstream_404_is_wrapped_in_the_envelope() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) =
        spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |_| {}).await;

    let resp = http_client()
        .post(format!("{proxy_url}/v1/embeddings"))
        .header("content-type", "application/json")
        .body(br#"{"model":"m1","input":"x"}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let envelope: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(envelope["error"]["code"], "upstream_404");
}

#[tokio::test]
async fn catch_all_forwards_unlisted_routes() {
    let (upstream_url, upstream) = spawn_upstream().await;
    let (proxy_url, _dir) =
        spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |_| {}).await;

    let resp = http_client()
        .post(format!("{proxy_url}/v1/some/new/route"))
        .header("content-type", "application/json")
        .body(br#"{"model":"m1"}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let captured = upstream.captured.lock().unwrap();
    assert!(captured.iter().any(|c| c.path == "/v1/some/new/route"));
}

#[tokio::test]
async fn bearer_auth_guards_proxy_routes_but_not_exempt_paths() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) = spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |s| {
        s.auth_required = true;
        s.bearer_token = "secret".to_string();
    })
    .await;
    let client = http_client();

    let resp = client
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(br#"{"model":"m1"}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let envelope: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(envelope["error"]["type"], "authentication_error");

    let resp = client
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret")
        .body(br#"{"model":"m1"}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // Exempt paths answer without a token.
    let resp = client.get(format!("{proxy_url}/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = client.get(format!("{proxy_url}/v1/models")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // Internal paths stay guarded.
    let resp = client
        .get(format!("{proxy_url}/internal/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn rate_limit_admits_burst_then_rejects() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) = spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |s| {
        s.rate_limit_rps = 2.0;
        s.rate_limit_burst = 2.0;
    })
    .await;
    let client = http_client();

    let mut statuses = Vec::new();
    for _ in 0..5 {
        let resp = client.get(format!("{proxy_url}/health")).send().await.unwrap();
        statuses.push(resp.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429, 429, 429]);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let resp = client.get(format!("{proxy_url}/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = client.get(format!("{proxy_url}/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = client.get(format!("{proxy_url}/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 429);
}

#[tokio::test]
async fn oversized_bodies_are_rejected_with_413() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) = spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |s| {
        s.max_body_bytes = 16;
    })
    .await;
    let client = http_client();

    // Declared length over the cap.
    let resp = client
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(vec![b' '; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    let envelope: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(envelope["error"]["type"], "request_too_large");

    // Chunked body with no declared length trips the stream-time counter.
    let stream = futures_util::stream::iter(
        (0..8).map(|_| Ok::<Bytes, std::io::Error>(Bytes::from_static(b"        "))),
    );
    let resp = client
        .post(format!("{proxy_url}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(wreq::Body::wrap_stream(stream))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
}

#[tokio::test]
async fn streamed_responses_are_mirrored_and_replayable() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let log = Arc::new(MemoryStreamLog::new());
    let (proxy_url, _dir) =
        spawn_proxy(&[("m1", upstream_url.as_str(), "")], Some(log.clone()), |_| {}).await;
    let client = http_client();

    let resp = client
        .post(format!("{proxy_url}/v1/responses?stream=true"))
        .header("content-type", "application/json")
        .header("x-stream-key", "sk1")
        .body(br#"{"model":"m1","stream":true}"#.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.bytes().await.unwrap();
    // Byte-identical passthrough, split code point included.
    assert_eq!(body.as_ref(), b"data: \xF0\x9F\x99\x82\n\n");

    // Mirror may need a beat to write the terminal marker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries: Vec<serde_json::Value> = log
        .entries("sk1")
        .into_iter()
        .map(|e| serde_json::from_str(&e.json.unwrap()).unwrap())
        .collect();
    assert_eq!(entries.last().unwrap(), &serde_json::json!({"done": true}));
    let decoded: String = entries
        .iter()
        .filter_map(|e| e.get("chunk").and_then(|c| c.as_str()))
        .collect();
    assert_eq!(decoded, "data: \u{1F642}\n\n");
    assert_eq!(log.trims(), vec![("sk1".to_string(), 10_000)]);

    // And the log replays as SSE.
    let resp = client
        .get(format!("{proxy_url}/internal/streams/sk1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let replay = String::from_utf8(resp.bytes().await.unwrap().to_vec()).unwrap();
    assert!(replay.contains("\"chunk\""));
    assert!(replay.contains(r#"{"done":true}"#));
    assert!(replay.ends_with("\n\n"));
}

#[tokio::test]
async fn replay_without_a_stream_log_is_503() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) =
        spawn_proxy(&[("m1", upstream_url.as_str(), "")], None, |_| {}).await;

    let resp = http_client()
        .get(format!("{proxy_url}/internal/streams/sk1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    let envelope: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(envelope["error"]["type"], "api_error");
}

#[tokio::test]
async fn model_list_is_sorted_and_gated_by_public_flag() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) = spawn_proxy(
        &[
            ("zebra", upstream_url.as_str(), ""),
            ("alpha", upstream_url.as_str(), ""),
        ],
        None,
        |_| {},
    )
    .await;
    let client = http_client();

    let resp = client.get(format!("{proxy_url}/v1/models")).send().await.unwrap();
    let listing: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(listing["object"], "list");
    assert_eq!(listing["data"][0]["id"], "alpha");
    assert_eq!(listing["data"][1]["id"], "zebra");
    assert_eq!(listing["data"][0]["owned_by"], "proxy");

    // Public listing off: 404 on the public path, internal still served.
    let (gated_url, _dir2) = spawn_proxy(
        &[("alpha", upstream_url.as_str(), "")],
        None,
        |s| s.public_models = false,
    )
    .await;
    let resp = client.get(format!("{gated_url}/v1/models")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let resp = client
        .get(format!("{gated_url}/internal/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn health_aggregates_upstreams() {
    let (upstream_url, _upstream) = spawn_upstream().await;
    let (proxy_url, _dir) = spawn_proxy(
        &[("m1", upstream_url.as_str(), "")],
        None,
        |s| s.public_health_details = true,
    )
    .await;

    let resp = http_client()
        .get(format!("{proxy_url}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let health: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(health["status"], "ok");
    let detail = &health["upstreams"][upstream_url.as_str()];
    assert_eq!(detail["ok"], true);
    assert_eq!(detail["models"][0], "m1");
    assert!(detail["latency_ms"].is_u64());
}
