//! Append-only sink for attempts and budget snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::action::ActionAttempt;
use crate::guard::SessionBudget;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    Attempt(ActionAttempt),
    Budget {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
        usage: SessionBudget,
    },
}

impl JournalRecord {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::Attempt(a) => a.session_id,
            Self::Budget { session_id, .. } => *session_id,
        }
    }
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, record: JournalRecord) -> Result<(), JournalError>;
}

/// JSON Lines file, opened in append mode.
pub struct JsonlJournal {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlJournal {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if !ends_with_newline(&path).await? {
            file.write_all(b"\n").await?;
        }
        tracing::info!(path = %path.display(), "Journal opened");
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts this file holds from `since` onwards. A line that does not
    /// parse, such as one torn by a crash mid-write, is skipped.
    pub async fn history(&self, since: DateTime<Utc>) -> Result<Vec<ActionAttempt>, JournalError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut attempts = Vec::new();
        for (index, line) in raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(JournalRecord::Attempt(attempt)) if attempt.timestamp >= since => attempts.push(attempt),
                Ok(_) => {}
                Err(e) => tracing::warn!(line = index + 1, error = %e, "Skipping unreadable journal line"),
            }
        }
        Ok(attempts)
    }

    /// Every record in a journal file, in write order.
    pub async fn read_all(path: &Path) -> Result<Vec<JournalRecord>, JournalError> {
        let raw = tokio::fs::read_to_string(path).await?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(JournalError::from))
            .collect()
    }
}

/// True for an empty file, so a torn last line is closed before appending.
async fn ends_with_newline(path: &Path) -> Result<bool, JournalError> {
    let mut file = tokio::fs::File::open(path).await?;
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

#[async_trait]
impl Journal for JsonlJournal {
    async fn append(&self, record: JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory. Used by dry runs and tests.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attempts(&self) -> Vec<ActionAttempt> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                JournalRecord::Attempt(a) => Some(a),
                JournalRecord::Budget { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, record: JournalRecord) -> Result<(), JournalError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}
