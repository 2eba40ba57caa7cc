//! The device capability: everything the engine needs from a phone.
//!
//! Components receive an `Arc<dyn Device>` handle at construction; there is
//! no process-wide connection.

mod adb;
mod scripted;

pub use adb::AdbDevice;
pub use scripted::{DeviceEvent, ScriptedDevice};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::snapshot::{DeviceSnapshot, Point, Resolution};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Transport lost. Distinct from "element not found".
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("ui did not settle within {0:?}")]
    Timeout(Duration),

    #[error("element not found: {0}")]
    NotFound(String),

    #[error("device command failed: {0}")]
    Command(String),

    #[error("malformed ui hierarchy: {0}")]
    Hierarchy(String),
}

impl DeviceError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// A connected device. Each input method issues exactly one input event.
#[async_trait]
pub trait Device: Send + Sync {
    /// Current UI hierarchy together with the screen size.
    async fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError>;

    async fn resolution(&self) -> Result<Resolution, DeviceError>;

    async fn tap(&self, at: Point) -> Result<(), DeviceError>;

    /// Types into whatever field currently has focus.
    async fn type_text(&self, text: &str) -> Result<(), DeviceError>;

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<(), DeviceError>;

    async fn press_back(&self) -> Result<(), DeviceError>;

    /// PNG-encoded screen capture.
    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError>;
}
