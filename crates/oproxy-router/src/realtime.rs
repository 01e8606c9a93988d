use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use oproxy_core::Upstream;
use oproxy_core::events::{ActionLog, LogEvent};
use oproxy_core::realtime::{connect_upstream, realtime_upstream_url};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::Level;

use crate::Ctx;
use crate::middleware::bearer_ok;
use crate::proxy::query_param;

/// `/v1/realtime`: authenticate, resolve the model, then shuttle frames
/// between the client and the upstream realtime endpoint until either side
/// closes. Handshake failures are answered with WS close codes, not HTTP.
pub async fn realtime(
    State(ctx): State<Ctx>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let settings = &ctx.core.settings;
    if settings.auth_required
        && !bearer_ok(headers.get(header::AUTHORIZATION), &settings.bearer_token)
    {
        return ws.on_upgrade(|socket| close_with(socket, 4401, "unauthorized"));
    }

    let model = query.as_deref().and_then(|q| query_param(q, "model"));
    let Some(model) = model.filter(|m| !m.is_empty()) else {
        return ws.on_upgrade(|socket| close_with(socket, 4400, "missing model"));
    };

    let cfg = match ctx.core.config.get() {
        Ok(cfg) => cfg,
        Err(_) => return ws.on_upgrade(|socket| close_with(socket, 1011, "config error")),
    };
    let Some(upstream) = cfg.upstreams.get(&model).cloned() else {
        return ws.on_upgrade(|socket| close_with(socket, 4404, "unknown model"));
    };

    let url = realtime_upstream_url(&upstream, query.as_deref());
    let tls_verify = settings.tls_verify;
    let log = ctx.core.log.clone();
    ws.on_upgrade(move |socket| shuttle(socket, upstream, url, tls_verify, log))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn shuttle(mut client: WebSocket, upstream: Upstream, url: String, tls_verify: bool, log: ActionLog) {
    let mut remote = match connect_upstream(&url, &upstream, tls_verify).await {
        Ok(remote) => remote,
        Err(err) => {
            log.emit(
                LogEvent::new("proxy_ws", "connect_upstream", "error")
                    .level(Level::WARN)
                    .detail("upstream", &upstream.base_url)
                    .detail("error", err.to_string()),
            );
            close_with(client, 1011, "upstream connect failed").await;
            return;
        }
    };

    loop {
        tokio::select! {
            from_client = client.recv() => match from_client {
                Some(Ok(Message::Text(text))) => {
                    if remote
                        .send(UpstreamMessage::Text(text.as_str().into()))
                        .await
                        .is_err()
                    {
                        let _ = close_client(&mut client, 1011, "upstream send failed").await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if remote.send(UpstreamMessage::Binary(data)).await.is_err() {
                        let _ = close_client(&mut client, 1011, "upstream send failed").await;
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    let _ = remote.close(None).await;
                    break;
                }
                // axum answers pings itself; pongs need no relay.
                Some(Ok(_)) => {}
            },
            from_upstream = remote.next() => match from_upstream {
                Some(Ok(UpstreamMessage::Text(text))) => {
                    if client
                        .send(Message::Text(text.as_str().into()))
                        .await
                        .is_err()
                    {
                        let _ = remote.close(None).await;
                        break;
                    }
                }
                Some(Ok(UpstreamMessage::Binary(data))) => {
                    if client.send(Message::Binary(data)).await.is_err() {
                        let _ = remote.close(None).await;
                        break;
                    }
                }
                Some(Ok(UpstreamMessage::Close(_))) | None => {
                    let _ = client.send(Message::Close(None)).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    log.emit(
                        LogEvent::new("proxy_ws", "shuttle", "upstream_error")
                            .level(Level::WARN)
                            .detail("upstream", &upstream.base_url)
                            .detail("error", err.to_string()),
                    );
                    let _ = close_client(&mut client, 1011, "upstream protocol error").await;
                    break;
                }
            },
        }
    }
}

async fn close_client(client: &mut WebSocket, code: u16, reason: &'static str) -> Result<(), axum::Error> {
    client
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
}
