use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};

use crate::config::Upstream;
use crate::upstream::join_upstream_url;

/// Upstream realtime URL: `join(base, "/v1/realtime")` with the scheme
/// rewritten to ws/wss and the query re-emitted with `model` replaced by the
/// upstream's own model id.
pub fn realtime_upstream_url(upstream: &Upstream, query: Option<&str>) -> String {
    let http_url = join_upstream_url(&upstream.base_url, "/v1/realtime");
    let ws_url = if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url
    };

    let mut pairs: Vec<(String, String)> = query
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();
    let mut replaced = false;
    for (key, value) in &mut pairs {
        if key == "model" {
            *value = upstream.model.clone();
            replaced = true;
        }
    }
    if !replaced {
        pairs.push(("model".to_string(), upstream.model.clone()));
    }
    match serde_urlencoded::to_string(&pairs) {
        Ok(q) if !q.is_empty() => format!("{ws_url}?{q}"),
        _ => ws_url,
    }
}

pub async fn connect_upstream(
    url: &str,
    upstream: &Upstream,
    tls_verify: bool,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = url.into_client_request()?;
    if !upstream.api_key.is_empty() {
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_str(&format!("Bearer {}", upstream.api_key))?,
        );
    }
    let connector = if url.starts_with("wss://") && !tls_verify {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };
    let (stream, _response) = connect_async_tls_with_config(request, None, false, connector).await?;
    Ok(stream)
}
