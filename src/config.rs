//! Runtime policy settings.
//!
//! Settings come from a YAML file and are shared as an `Arc<Settings>`
//! snapshot. Each request and each refresh tick reads one snapshot, so a
//! reload takes effect on the next request without a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::strategy::{ModelStrategyMap, Strategy};

/// Default OpenAI-compatible upstream.
pub const DEFAULT_UPSTREAM: &str = "https://api.siliconflow.cn";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Strategy used when a model has no override.
    pub default_strategy: Strategy,
    /// Model name to strategy id overrides.
    pub model_key_strategies: ModelStrategyMap,
    /// Keys below this balance are only used as a last resort.
    pub min_balance_threshold: f64,
    /// Extra attempts with other keys after a recoverable failure.
    pub max_retries: u32,
    /// Seconds between balance refresh cycles.
    pub auto_update_interval: u64,
    /// Seconds between RPM/TPM recomputations.
    pub rate_refresh_interval: u64,
    /// Seconds between key metric flushes to the database.
    pub stats_refresh_interval: u64,
    /// Per-key timeout for balance queries, in seconds.
    pub refresh_timeout: u64,
    /// Maximum concurrent balance queries in one cycle.
    pub refresh_concurrency: usize,
    /// Seconds to wait for upstream response headers.
    pub request_timeout: u64,
    /// Disable keys whose refreshed balance reaches zero.
    pub auto_disable_zero_balance: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::HighScore,
            model_key_strategies: ModelStrategyMap::new(),
            min_balance_threshold: 0.8,
            max_retries: 3,
            auto_update_interval: 600,
            rate_refresh_interval: 15,
            stats_refresh_interval: 30,
            refresh_timeout: 10,
            refresh_concurrency: 8,
            request_timeout: 120,
            auto_disable_zero_balance: false,
        }
    }
}

impl Settings {
    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn auto_update_interval(&self) -> Duration {
        Duration::from_secs(self.auto_update_interval.max(1))
    }

    pub fn rate_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.rate_refresh_interval.max(1))
    }

    pub fn stats_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.stats_refresh_interval.max(1))
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }
}

async fn write_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let raw = serde_yaml::to_string(settings).map_err(ConfigError::Encode)?;
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
    }
    tokio::fs::write(path, raw).await.map_err(write_error)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write settings file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[source] serde_yaml::Error),
    #[error("settings were not loaded from a file")]
    NoSource,
}

/// Shared, replaceable settings snapshot.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    current: Arc<RwLock<Arc<Settings>>>,
    writer: Arc<Mutex<()>>,
    source: Option<PathBuf>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            writer: Arc::new(Mutex::new(())),
            source: None,
        }
    }

    /// Loads settings from `path`. A missing file yields defaults so a fresh
    /// install starts without any configuration.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = if path.exists() {
            Settings::load(&path)?
        } else {
            info!(path = %path.display(), "settings file not found, using defaults");
            Settings::default()
        };
        let mut handle = Self::new(settings);
        handle.source = Some(path);
        Ok(handle)
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, settings: Settings) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    /// Applies `change` to a copy of the current settings, writes the copy to
    /// the settings file when there is one, and publishes it only after the
    /// write succeeded. Commits are serialized so none is lost.
    pub async fn commit<T>(
        &self,
        change: impl FnOnce(&mut Settings) -> T,
    ) -> Result<(Arc<Settings>, T), ConfigError> {
        let _writer = self.writer.lock().await;
        let mut next = Settings::clone(&self.snapshot());
        let outcome = change(&mut next);
        if let Some(path) = &self.source {
            write_settings(path, &next).await?;
        }
        let next = Arc::new(next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        Ok((next, outcome))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Re-reads the settings file and swaps the snapshot. On error the
    /// current snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<Settings>, ConfigError> {
        let path = self.source.as_ref().ok_or(ConfigError::NoSource)?;
        let settings = if path.exists() {
            Settings::load(path)?
        } else {
            Settings::default()
        };
        self.replace(settings);
        let snapshot = self.snapshot();
        info!(
            path = %path.display(),
            default_strategy = snapshot.default_strategy.name(),
            overrides = snapshot.model_key_strategies.len(),
            "settings reloaded"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_yaml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.default_strategy, Strategy::HighScore);
    }

    #[test]
    fn parses_strategy_ids_and_overrides() {
        let raw = r#"
default_strategy: 5
min_balance_threshold: 2.5
max_retries: 1
model_key_strategies:
  "deepseek-ai/DeepSeek-V3": 4
  "BAAI/bge-m3": 3
  "weird-model": 42
"#;
        let settings = Settings::from_yaml_str(raw).unwrap();
        assert_eq!(settings.default_strategy, Strategy::HighBalance);
        assert_eq!(settings.min_balance_threshold, 2.5);
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.rate_refresh_interval, 15);

        let overrides = &settings.model_key_strategies;
        assert_eq!(
            overrides.lookup("deepseek-ai/deepseek-v3"),
            Some(Strategy::LowTpm)
        );
        assert_eq!(overrides.lookup("BAAI/bge-m3"), Some(Strategy::LowRpm));
        assert_eq!(overrides.lookup("weird-model"), Some(Strategy::HighScore));
    }

    #[test]
    fn zero_intervals_are_raised_to_one_second() {
        let settings = Settings {
            auto_update_interval: 0,
            refresh_timeout: 0,
            ..Settings::default()
        };
        assert_eq!(settings.auto_update_interval(), Duration::from_secs(1));
        assert_eq!(settings.refresh_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn reload_swaps_snapshot_and_keeps_old_one_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "default_strategy: 3\n").unwrap();

        let handle = SettingsHandle::from_file(&path).unwrap();
        let before = handle.snapshot();
        assert_eq!(before.default_strategy, Strategy::LowRpm);

        std::fs::write(&path, "default_strategy: 1\nmax_retries: 7\n").unwrap();
        let after = handle.reload().unwrap();
        assert_eq!(after.default_strategy, Strategy::HighSuccessRate);
        assert_eq!(after.max_retries, 7);
        assert_eq!(before.default_strategy, Strategy::LowRpm);

        std::fs::write(&path, "max_retries: [not a number]\n").unwrap();
        assert!(matches!(handle.reload(), Err(ConfigError::Parse { .. })));
        assert_eq!(handle.snapshot().max_retries, 7);
    }

    #[tokio::test]
    async fn commit_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("settings.yaml");
        let handle = SettingsHandle::from_file(&path).unwrap();

        let before = handle.snapshot();
        let (after, ()) = handle
            .commit(|s| {
                s.model_key_strategies.insert("BAAI/bge-m3", Strategy::LowRpm);
                s.max_retries = 5;
            })
            .await
            .unwrap();
        assert!(before.model_key_strategies.is_empty());
        assert_eq!(after.max_retries, 5);
        assert_eq!(handle.snapshot(), after);

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded, *after);
        assert_eq!(
            reloaded.model_key_strategies.lookup("baai/bge-m3"),
            Some(Strategy::LowRpm)
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_snapshot_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let handle = SettingsHandle::from_file(blocker.join("settings.yaml")).unwrap();

        let result = handle.commit(|s| s.max_retries = 9).await;
        assert!(matches!(result, Err(ConfigError::Write { .. })));
        assert_eq!(*handle.snapshot(), Settings::default());
    }

    #[tokio::test]
    async fn in_memory_commit_publishes_without_a_file() {
        let handle = SettingsHandle::new(Settings::default());
        let (after, previous) = handle
            .commit(|s| std::mem::replace(&mut s.max_retries, 1))
            .await
            .unwrap();
        assert_eq!(previous, 3);
        assert_eq!(after.max_retries, 1);
        assert_eq!(handle.snapshot().max_retries, 1);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let handle = SettingsHandle::from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(*handle.snapshot(), Settings::default());
        assert!(matches!(
            SettingsHandle::new(Settings::default()).reload(),
            Err(ConfigError::NoSource)
        ));
    }
}
