use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use gram_pilot::{
    AdbDevice, Analyzer, DeviceLock, Engine, EngineError, JournalRecord, JsonlJournal, LocatorCatalog,
    OpenAiAnalyzer, SessionConfig, SessionGuard,
};

use crate::Cli;

/// File, then environment, then flags.
pub fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    config.apply_env();
    if let Some(serial) = &cli.serial {
        config.device_serial = Some(serial.clone());
    }
    if let Some(journal) = &cli.journal {
        config.journal_path = Some(journal.clone());
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog_path = Some(catalog.clone());
    }
    config.validate()?;
    Ok(config)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Machine-readable form of a failure that ended the session.
pub fn error_report(err: &anyhow::Error) -> Option<serde_json::Value> {
    let engine = err.downcast_ref::<EngineError>()?;
    Some(serde_json::json!({
        "error": engine.code(),
        "detail": engine.to_string(),
    }))
}

pub fn print_catalog() -> Result<()> {
    print_json(&LocatorCatalog::builtin()?.to_file())
}

pub async fn summarize_journal(config: &SessionConfig) -> Result<()> {
    let path = config.journal_path_or_default();
    let records = JsonlJournal::read_all(&path)
        .await
        .with_context(|| format!("Failed to read journal {}", path.display()))?;

    let mut rows = Vec::new();
    for record in records {
        if let JournalRecord::Attempt(attempt) = record {
            rows.push(serde_json::json!({
                "timestamp": attempt.timestamp,
                "action": attempt.logical_action,
                "parameter": attempt.parameter,
                "outcome": attempt.outcome,
                "strategy": attempt.strategy_used.map(|s| s.to_string()),
                "latency_ms": attempt.latency_ms,
                "error": attempt.error_detail,
            }));
        }
    }
    print_json(&rows)
}

/// A connected device with the engine and guard built around it.
pub struct Session {
    pub engine: Engine,
    config: SessionConfig,
    rollover: JoinHandle<()>,
    _lock: DeviceLock,
}

impl Session {
    pub async fn start(config: SessionConfig) -> Result<Self> {
        let device = AdbDevice::connect(config.device_serial.as_deref())
            .await
            .context("Failed to connect to the device")?;
        let lock = DeviceLock::acquire(&config.lock_dir_or_default(), device.serial())?;
        device
            .launch_app(&config.app_package)
            .await
            .with_context(|| format!("Failed to launch {}", config.app_package))?;

        let catalog = match &config.catalog_path {
            Some(path) => LocatorCatalog::load(path)
                .with_context(|| format!("Failed to load catalog {}", path.display()))?,
            None => LocatorCatalog::builtin()?,
        };

        let journal_path = config.journal_path_or_default();
        let journal = JsonlJournal::open(&journal_path)
            .await
            .with_context(|| format!("Failed to open journal {}", journal_path.display()))?;
        tracing::info!(path = %journal.path().display(), "Journal ready");

        let guard = Arc::new(SessionGuard::new(config.guard.clone()));
        let since = Utc::now() - chrono::Duration::from_std(config.guard.longest_window())?;
        let history = journal
            .history(since)
            .await
            .with_context(|| format!("Failed to read journal {}", journal_path.display()))?;
        guard.restore(&history);
        let rollover = guard.spawn_rollover(Duration::from_secs(config.rollover_interval_secs.max(1)));

        let mut engine = Engine::new(Arc::new(device), Arc::new(catalog), guard, Arc::new(journal), &config);
        match OpenAiAnalyzer::from_env(&config.ai_model, &config.ai_endpoint) {
            Ok(analyzer) => engine = engine.with_vision(Arc::new(analyzer)),
            Err(e) => tracing::info!(reason = %e, "Vision locator disabled"),
        }

        Ok(Self {
            engine,
            config,
            rollover,
            _lock: lock,
        })
    }

    /// Analyzer for workflows that cannot run without one.
    pub fn analyzer(&self) -> Result<Arc<dyn Analyzer>> {
        let analyzer = OpenAiAnalyzer::from_env(&self.config.ai_model, &self.config.ai_endpoint)
            .context("This command needs image and text analysis")?;
        Ok(Arc::new(analyzer))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.rollover.abort();
        let budget = self.engine.guard().snapshot();
        tracing::info!(
            session_id = %self.engine.session_id(),
            consecutive_failures = budget.consecutive_failures,
            halted = budget.halted.is_some(),
            "Session closed"
        );
    }
}
