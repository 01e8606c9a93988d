use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::config::ConfigProvider;
use crate::events::ActionLog;
use crate::settings::Settings;
use crate::state::AppState;
use crate::upstream::CapsCache;

const CAPS_TTL: Duration = Duration::from_secs(60);
const LOG_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "oproxy",
    version,
    about = "Model-aware OpenAI-compatible reverse proxy"
)]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "PORT")]
    pub port: Option<String>,

    /// Path to the YAML model map.
    #[arg(long, env = "CONFIG_PATH")]
    pub config_path: Option<String>,

    /// Seconds between config mtime polls.
    #[arg(long, env = "CONFIG_CACHE_TTL")]
    pub config_cache_ttl: Option<String>,

    /// Upstream I/O timeout in seconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    pub upstream_timeout: Option<String>,

    /// Verify upstream TLS certificates.
    #[arg(long, env = "TLS_VERIFY")]
    pub tls_verify: Option<String>,

    /// Permit the one-shot HTTPS to HTTP retry for allow-listed hosts.
    #[arg(long, env = "ALLOW_SSL_DOWNGRADE")]
    pub allow_ssl_downgrade: Option<String>,

    /// Comma-separated host allow-list for the plaintext retry.
    #[arg(long, env = "SSL_DOWNGRADE_ALLOWLIST")]
    pub ssl_downgrade_allowlist: Option<String>,

    /// Replay buffer cap for retried request bodies, in bytes.
    #[arg(long, env = "FALLBACK_BUFFER_BYTES")]
    pub fallback_buffer_bytes: Option<String>,

    /// Maximum accepted request body, in bytes.
    #[arg(long, env = "MAX_BODY_BYTES")]
    pub max_body_bytes: Option<String>,

    /// How many leading body bytes to inspect for the model field.
    #[arg(long, env = "SNIFF_BYTES")]
    pub sniff_bytes: Option<String>,

    /// Require a bearer token on non-exempt routes.
    #[arg(long, env = "AUTH_REQUIRED")]
    pub auth_required: Option<String>,

    /// The accepted bearer token.
    #[arg(long, env = "BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// Token-bucket refill rate per client IP; zero disables the limiter.
    #[arg(long, env = "RATE_LIMIT_RPS")]
    pub rate_limit_rps: Option<String>,

    /// Token-bucket capacity; falls back to the refill rate when unset.
    #[arg(long, env = "RATE_LIMIT_BURST")]
    pub rate_limit_burst: Option<String>,

    /// Expose the model list on the public path.
    #[arg(long, env = "PUBLIC_MODELS")]
    pub public_models: Option<String>,

    /// Include per-upstream details in public /health responses.
    #[arg(long, env = "PUBLIC_HEALTH_DETAILS")]
    pub public_health_details: Option<String>,

    /// Redis URL for the SSE stream log; mirroring is off when unset.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Log level filter.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

pub struct Bootstrap {
    pub state: Arc<AppState>,
    pub log_worker: tokio::task::JoinHandle<()>,
}

pub fn settings_from_args(args: &CliArgs) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let settings = Settings {
        host: sanitize(args.host.clone()).unwrap_or(defaults.host),
        port: parse_num::<u16>(args.port.clone(), "PORT")?.unwrap_or(defaults.port),
        config_path: sanitize(args.config_path.clone())
            .map(PathBuf::from)
            .unwrap_or(defaults.config_path),
        config_cache_ttl: parse_secs(args.config_cache_ttl.clone(), "CONFIG_CACHE_TTL")?
            .unwrap_or(defaults.config_cache_ttl),
        upstream_timeout: parse_secs(args.upstream_timeout.clone(), "UPSTREAM_TIMEOUT")?
            .unwrap_or(defaults.upstream_timeout),
        tls_verify: parse_bool(args.tls_verify.clone(), "TLS_VERIFY")?.unwrap_or(defaults.tls_verify),
        allow_ssl_downgrade: parse_bool(args.allow_ssl_downgrade.clone(), "ALLOW_SSL_DOWNGRADE")?
            .unwrap_or(defaults.allow_ssl_downgrade),
        ssl_downgrade_allowlist: parse_host_set(args.ssl_downgrade_allowlist.as_deref()),
        fallback_buffer_bytes: parse_num::<usize>(
            args.fallback_buffer_bytes.clone(),
            "FALLBACK_BUFFER_BYTES",
        )?
        .unwrap_or(defaults.fallback_buffer_bytes),
        max_body_bytes: parse_num::<u64>(args.max_body_bytes.clone(), "MAX_BODY_BYTES")?
            .unwrap_or(defaults.max_body_bytes),
        sniff_bytes: parse_num::<usize>(args.sniff_bytes.clone(), "SNIFF_BYTES")?
            .unwrap_or(defaults.sniff_bytes),
        auth_required: parse_bool(args.auth_required.clone(), "AUTH_REQUIRED")?
            .unwrap_or(defaults.auth_required),
        bearer_token: sanitize(args.bearer_token.clone()).unwrap_or(defaults.bearer_token),
        rate_limit_rps: parse_num::<f64>(args.rate_limit_rps.clone(), "RATE_LIMIT_RPS")?
            .unwrap_or(defaults.rate_limit_rps),
        rate_limit_burst: parse_num::<f64>(args.rate_limit_burst.clone(), "RATE_LIMIT_BURST")?
            .unwrap_or(defaults.rate_limit_burst),
        public_models: parse_bool(args.public_models.clone(), "PUBLIC_MODELS")?
            .unwrap_or(defaults.public_models),
        public_health_details: parse_bool(
            args.public_health_details.clone(),
            "PUBLIC_HEALTH_DETAILS",
        )?
        .unwrap_or(defaults.public_health_details),
        redis_url: sanitize(args.redis_url.clone()),
        log_level: sanitize(args.log_level.clone()).unwrap_or(defaults.log_level),
    };
    settings.validate()?;
    Ok(settings)
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let settings = settings_from_args(&args)?;
    bootstrap_with_settings(settings).await
}

pub async fn bootstrap_with_settings(settings: Settings) -> anyhow::Result<Bootstrap> {
    let config = ConfigProvider::load(settings.config_path.clone(), settings.config_cache_ttl)
        .with_context(|| format!("load config {}", settings.config_path.display()))?;

    let client = build_client(&settings).context("build upstream client")?;
    let caps_client = build_client(&settings).context("build capability client")?;

    let (log, worker) = ActionLog::new(LOG_QUEUE_CAPACITY);
    let log_worker = tokio::spawn(worker.run());

    let state = AppState {
        caps: CapsCache::new(CAPS_TTL),
        settings,
        config,
        client,
        caps_client,
        log,
    };
    Ok(Bootstrap {
        state: Arc::new(state),
        log_worker,
    })
}

fn build_client(settings: &Settings) -> Result<wreq::Client, wreq::Error> {
    let mut builder = wreq::Client::builder()
        .connect_timeout(settings.upstream_timeout)
        .read_timeout(settings.upstream_timeout);
    if !settings.tls_verify {
        builder = builder.tls_cert_verification(false);
    }
    builder.build()
}

fn sanitize(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems inject unresolved placeholders like `${VAR}`; treat
    // them as "not set".
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_num<T: std::str::FromStr>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = sanitize(value) else {
        return Ok(None);
    };
    match raw.parse::<T>() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(err) => Err(anyhow::anyhow!("invalid {env_name} value {raw}: {err}")),
    }
}

fn parse_secs(value: Option<String>, env_name: &str) -> anyhow::Result<Option<Duration>> {
    let Some(secs) = parse_num::<f64>(value, env_name)? else {
        return Ok(None);
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow::anyhow!("invalid {env_name} value: {secs}"));
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

fn parse_bool(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

fn parse_host_set(raw: Option<&str>) -> HashSet<String> {
    raw.unwrap_or("")
        .split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}
