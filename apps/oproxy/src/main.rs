use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use oproxy_core::bootstrap::{CliArgs, bootstrap};
use oproxy_router::Ctx;
use oproxy_storage::{RedisStreamLog, StreamLog};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_level.as_deref());

    let boot = bootstrap(args).await?;
    let settings = &boot.state.settings;

    let stream_log: Option<Arc<dyn StreamLog>> = match settings.redis_url.as_deref() {
        Some(url) => Some(Arc::new(
            RedisStreamLog::connect(url)
                .await
                .context("connect stream log")?,
        )),
        None => None,
    };

    let bind = format!("{}:{}", settings.host, settings.port);
    let ctx = Ctx::new(boot.state.clone(), stream_log);
    let app = oproxy_router::router(ctx)
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!("listening on {bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued log events before exiting.
    boot.state.log.shutdown().await;
    boot.log_worker.await?;
    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = log_level
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .map(|level| EnvFilter::new(level.to_ascii_lowercase()))
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
