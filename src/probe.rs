use std::sync::Arc;
use std::time::Duration;

use crate::device::{Device, DeviceError};
use crate::snapshot::{DeviceSnapshot, Resolution};

/// How long and how often to look at the UI before declaring it settled.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Wait for two consecutive identical dumps before returning.
    pub require_stable: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(250),
            require_stable: true,
        }
    }
}

/// Captures snapshots from the live device.
pub struct DeviceProbe {
    device: Arc<dyn Device>,
    settings: ProbeSettings,
}

impl DeviceProbe {
    pub fn new(device: Arc<dyn Device>, settings: ProbeSettings) -> Self {
        Self { device, settings }
    }

    /// Fresh snapshot once the UI has stopped changing. Fails with
    /// `Timeout` if it keeps changing for longer than the configured bound.
    pub async fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
        match tokio::time::timeout(self.settings.timeout, self.settle()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.settings.timeout, "UI did not settle");
                Err(DeviceError::Timeout(self.settings.timeout))
            }
        }
    }

    pub async fn resolution(&self) -> Result<Resolution, DeviceError> {
        self.device.resolution().await
    }

    pub async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        self.device.screenshot().await
    }

    async fn settle(&self) -> Result<DeviceSnapshot, DeviceError> {
        let mut previous = self.device.snapshot().await?;
        if !self.settings.require_stable {
            return Ok(previous);
        }
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            let current = self.device.snapshot().await?;
            if current.same_screen(&previous) {
                tracing::trace!(elements = current.elements.len(), "UI settled");
                return Ok(current);
            }
            previous = current;
        }
    }
}
