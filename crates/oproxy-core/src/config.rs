use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use serde::Deserialize;

/// One inference backend, keyed by the model id it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub model: String,
    /// Absolute `http(s)://host[:port][/path]`, no trailing slash.
    pub base_url: String,
    /// Empty when the backend needs no auth.
    pub api_key: String,
}

/// Immutable view of the config file at one point in time.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub upstreams: HashMap<String, Upstream>,
    pub mtime: SystemTime,
    pub loaded_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate model in config: {0}")]
    DuplicateModel(String),
    #[error("invalid base_url for model {model}: {base_url}")]
    InvalidBaseUrl { model: String, base_url: String },
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(default)]
    model: String,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    api_key: String,
}

fn parse_config(raw: &str) -> Result<HashMap<String, Upstream>, ConfigError> {
    let file: ConfigFile = serde_yaml::from_str(raw)?;
    let mut out = HashMap::new();
    for entry in file.models {
        let model = entry.model.trim().to_string();
        let base_url = entry.base_url.trim().trim_end_matches('/').to_string();
        let api_key = entry.api_key.trim().to_string();
        if model.is_empty() || base_url.is_empty() {
            continue;
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidBaseUrl { model, base_url });
        }
        if out.contains_key(&model) {
            return Err(ConfigError::DuplicateModel(model));
        }
        out.insert(
            model.clone(),
            Upstream {
                model,
                base_url,
                api_key,
            },
        );
    }
    Ok(out)
}

fn load_snapshot(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let mtime = std::fs::metadata(path)?.modified()?;
    let raw = std::fs::read_to_string(path)?;
    Ok(ConfigSnapshot {
        upstreams: parse_config(&raw)?,
        mtime,
        loaded_at: Instant::now(),
    })
}

/// Serves config snapshots with mtime+TTL refresh. The published snapshot is
/// swapped atomically, so in-flight requests keep a consistent view.
pub struct ConfigProvider {
    path: PathBuf,
    ttl: Duration,
    current: ArcSwap<ConfigSnapshot>,
    refresh: Mutex<()>,
}

impl ConfigProvider {
    /// Loads the file once; startup fails on an unreadable or invalid config.
    pub fn load(path: PathBuf, ttl: Duration) -> Result<Self, ConfigError> {
        let snapshot = load_snapshot(&path)?;
        Ok(Self {
            path,
            ttl,
            current: ArcSwap::from_pointee(snapshot),
            refresh: Mutex::new(()),
        })
    }

    /// The mtime is polled on every access; the reparse is skipped only when
    /// the published snapshot is both fresh by TTL and from the same mtime,
    /// so an edited file is picked up inside the TTL window too.
    pub fn get(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let mtime = std::fs::metadata(&self.path)?.modified()?;
        let snapshot = self.current.load_full();
        if snapshot.loaded_at.elapsed() < self.ttl && snapshot.mtime == mtime {
            return Ok(snapshot);
        }

        let Ok(_guard) = self.refresh.try_lock() else {
            // Another task is rereading; serve the current snapshot.
            return Ok(snapshot);
        };
        let snapshot = self.current.load_full();
        if snapshot.loaded_at.elapsed() < self.ttl && snapshot.mtime == mtime {
            return Ok(snapshot);
        }

        let reloaded = Arc::new(load_snapshot(&self.path)?);
        self.current.store(reloaded.clone());
        Ok(reloaded)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_models_and_strips_trailing_slash() {
        let cfg = parse_config(
            "models:\n  - { model: m1, base_url: \"http://a:8000/\", api_key: k }\n  - { model: m2, base_url: \"https://b/v1\" }\n",
        )
        .unwrap();
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg["m1"].base_url, "http://a:8000");
        assert_eq!(cfg["m1"].api_key, "k");
        assert_eq!(cfg["m2"].api_key, "");
    }

    #[test]
    fn duplicate_model_is_an_error() {
        let err = parse_config(
            "models:\n  - { model: m1, base_url: \"http://a\" }\n  - { model: m1, base_url: \"http://b\" }\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateModel(m) if m == "m1"));
    }

    #[test]
    fn relative_base_url_is_rejected() {
        let err = parse_config("models:\n  - { model: m1, base_url: \"a:8000\" }\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn entries_without_model_or_base_url_are_skipped() {
        let cfg = parse_config(
            "models:\n  - { model: \"\", base_url: \"http://a\" }\n  - { model: m2, base_url: \"\" }\n",
        )
        .unwrap();
        assert!(cfg.is_empty());
    }

    #[test]
    fn provider_picks_up_mtime_change_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.yml");
        std::fs::write(&path, "models:\n  - { model: m1, base_url: \"http://a\" }\n").unwrap();

        let provider = ConfigProvider::load(path.clone(), Duration::from_secs(60)).unwrap();
        assert!(provider.get().unwrap().upstreams.contains_key("m1"));

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&path, "models:\n  - { model: m2, base_url: \"http://b\" }\n").unwrap();

        // Still well inside the TTL; the mtime poll alone forces the reread.
        let snapshot = provider.get().unwrap();
        assert!(snapshot.upstreams.contains_key("m2"));
        assert!(!snapshot.upstreams.contains_key("m1"));
    }

    #[test]
    fn provider_reloads_after_ttl_when_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.yml");
        std::fs::write(&path, "models:\n  - { model: m1, base_url: \"http://a\" }\n").unwrap();

        let provider = ConfigProvider::load(path.clone(), Duration::ZERO).unwrap();
        assert!(provider.get().unwrap().upstreams.contains_key("m1"));

        // Rewrite with a different mtime; TTL of zero forces the stat path.
        std::thread::sleep(Duration::from_millis(20));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "models:\n  - {{ model: m2, base_url: \"http://b\" }}").unwrap();
        drop(f);

        let snapshot = provider.get().unwrap();
        assert!(snapshot.upstreams.contains_key("m2"));
        assert!(!snapshot.upstreams.contains_key("m1"));
    }
}
