//! Session configuration: loaded once at start, immutable afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::executor::ExecutorSettings;
use crate::guard::GuardConfig;
use crate::probe::ProbeSettings;

pub const ENV_SERIAL: &str = "GRAM_PILOT_SERIAL";
pub const ENV_JOURNAL: &str = "GRAM_PILOT_JOURNAL";
pub const ENV_CATALOG: &str = "GRAM_PILOT_CATALOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// adb serial; the first online device when unset.
    pub device_serial: Option<String>,

    pub app_package: String,

    /// Locator catalog file; the built-in catalog when unset.
    pub catalog_path: Option<PathBuf>,

    /// JSON Lines journal file.
    pub journal_path: Option<PathBuf>,

    pub settle_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_poll_ms: u64,
    pub require_stable_ui: bool,

    /// Strategies tried per step before the step fails.
    pub max_strategy_attempts: u32,

    pub swipe_fraction: f64,
    pub swipe_duration_ms: u64,

    pub guard: GuardConfig,

    pub rollover_interval_secs: u64,

    /// Where per-device lock files live; the per-user data directory when unset.
    pub lock_dir: Option<PathBuf>,

    /// Words refused in outgoing messages, on top of the built-in list.
    pub blocked_words: Vec<String>,

    /// Model for analysis requests. The API key is read from
    /// `OPENAI_API_KEY` only.
    pub ai_model: String,
    pub ai_endpoint: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_serial: None,
            app_package: "com.instagram.android".to_string(),
            catalog_path: None,
            journal_path: None,
            settle_ms: 1_000,
            probe_timeout_ms: 3_000,
            probe_poll_ms: 250,
            require_stable_ui: true,
            max_strategy_attempts: 2,
            swipe_fraction: 0.6,
            swipe_duration_ms: 300,
            guard: GuardConfig::default(),
            rollover_interval_secs: 60,
            lock_dir: None,
            blocked_words: Vec::new(),
            ai_model: "gpt-4o-mini".to_string(),
            ai_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded session config");
        Ok(config)
    }

    /// Apply `GRAM_PILOT_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(serial) = get(ENV_SERIAL) {
            self.device_serial = Some(serial);
        }
        if let Some(journal) = get(ENV_JOURNAL) {
            self.journal_path = Some(PathBuf::from(journal));
        }
        if let Some(catalog) = get(ENV_CATALOG) {
            self.catalog_path = Some(PathBuf::from(catalog));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_strategy_attempts == 0 {
            return Err(ConfigError::Invalid("max_strategy_attempts must be at least 1".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be positive".into()));
        }
        if self.probe_poll_ms >= self.probe_timeout_ms {
            return Err(ConfigError::Invalid(
                "probe_poll_ms must be shorter than probe_timeout_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.swipe_fraction) {
            return Err(ConfigError::Invalid("swipe_fraction must be within 0..=1".into()));
        }
        let pacing = &self.guard.pacing;
        if pacing.min_delay_ms > pacing.max_delay_ms {
            return Err(ConfigError::Invalid("pacing min_delay_ms exceeds max_delay_ms".into()));
        }
        if !(0.0..=1.0).contains(&pacing.long_pause_chance) {
            return Err(ConfigError::Invalid("long_pause_chance must be within 0..=1".into()));
        }
        if self.guard.halt_after_failures == 0 {
            return Err(ConfigError::Invalid("halt_after_failures must be at least 1".into()));
        }
        if self.guard.hourly_limit == Some(0) {
            return Err(ConfigError::Invalid("hourly_limit must be at least 1 when set".into()));
        }
        for (category, limit) in &self.guard.budgets {
            if limit.window_secs == 0 {
                return Err(ConfigError::Invalid(format!("{category}: budget window must be positive")));
            }
        }
        Ok(())
    }

    /// Journal file, falling back to the per-user data directory.
    pub fn journal_path_or_default(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| data_dir().join("journal.jsonl"))
    }

    pub fn lock_dir_or_default(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(|| data_dir().join("locks"))
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            timeout: Duration::from_millis(self.probe_timeout_ms),
            poll_interval: Duration::from_millis(self.probe_poll_ms),
            require_stable: self.require_stable_ui,
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            settle: Duration::from_millis(self.settle_ms),
            swipe_fraction: self.swipe_fraction,
            swipe_duration: Duration::from_millis(self.swipe_duration_ms),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gram-pilot")
}
