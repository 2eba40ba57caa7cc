//! Exclusive claim on a device across processes.
//!
//! [`SessionGuard`](crate::SessionGuard) serialises input inside one
//! process. Two `gram-pilot` processes pointed at the same phone would still
//! interleave taps, so each session also holds an advisory file lock named
//! after the device serial.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("device {serial} is already driven by another session (pid {holder})")]
    Held { serial: String, holder: String },

    #[error("device lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the life of a session. Released on drop.
#[derive(Debug)]
pub struct DeviceLock {
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    /// Claim `serial` without waiting.
    pub fn acquire(dir: &Path, serial: &str) -> Result<Self, LockError> {
        let path = dir.join(format!("{}.lock", file_stem(serial)));
        let io = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(io(e));
            }
            let mut holder = String::new();
            file.read_to_string(&mut holder).map_err(io)?;
            let holder = match holder.trim() {
                "" => "unknown".to_string(),
                pid => pid.to_string(),
            };
            return Err(LockError::Held {
                serial: serial.to_string(),
                holder,
            });
        }

        file.set_len(0).map_err(io)?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        write!(file, "{}", std::process::id()).map_err(io)?;
        file.flush().map_err(io)?;

        tracing::info!(%serial, path = %path.display(), "Device lock taken");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release device lock");
        }
    }
}

/// Serials like `192.168.0.5:5555` are not valid file names everywhere.
fn file_stem(serial: &str) -> String {
    serial
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
