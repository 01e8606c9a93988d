use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Resolved runtime knobs. Built once at bootstrap from CLI/env and shared
/// read-only by every in-flight request.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    pub config_cache_ttl: Duration,
    pub upstream_timeout: Duration,
    pub tls_verify: bool,
    pub allow_ssl_downgrade: bool,
    /// Empty means "use the built-in localhost set".
    pub ssl_downgrade_allowlist: HashSet<String>,
    pub fallback_buffer_bytes: usize,
    pub max_body_bytes: u64,
    pub sniff_bytes: usize,
    pub auth_required: bool,
    pub bearer_token: String,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
    pub public_models: bool,
    pub public_health_details: bool,
    pub redis_url: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            config_path: PathBuf::from("config/models.yml"),
            config_cache_ttl: Duration::from_secs(1),
            upstream_timeout: Duration::from_secs(600),
            tls_verify: true,
            allow_ssl_downgrade: false,
            ssl_downgrade_allowlist: HashSet::new(),
            fallback_buffer_bytes: 1024 * 1024,
            max_body_bytes: 100 * 1024 * 1024,
            sniff_bytes: 1024 * 1024,
            auth_required: true,
            bearer_token: String::new(),
            rate_limit_rps: 0.0,
            rate_limit_burst: 0.0,
            public_models: true,
            public_health_details: false,
            redis_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_required && self.bearer_token.trim().is_empty() {
            anyhow::bail!("AUTH_REQUIRED is set but BEARER_TOKEN is empty");
        }
        Ok(())
    }

    /// Token-bucket capacity: burst when given, else rps.
    pub fn rate_limit_capacity(&self) -> f64 {
        if self.rate_limit_burst > 0.0 {
            self.rate_limit_burst
        } else {
            self.rate_limit_rps
        }
    }

    pub fn downgrade_host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if host.ends_with(".local") {
            return true;
        }
        if self.ssl_downgrade_allowlist.is_empty() {
            return matches!(host.as_str(), "localhost" | "127.0.0.1" | "::1");
        }
        self.ssl_downgrade_allowlist.contains(&host)
    }
}
