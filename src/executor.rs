use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::device::{Device, DeviceError};
use crate::resolver::ResolvedLocator;
use crate::snapshot::{Point, Resolution};

/// Finger movement direction for [`Primitive::Swipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    Tap,
    TypeText(String),
    Swipe(Direction),
    /// System back key.
    Back,
}

impl Primitive {
    pub fn needs_locator(&self) -> bool {
        matches!(self, Self::Tap)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::TypeText(_) => "type_text",
            Self::Swipe(_) => "swipe",
            Self::Back => "back",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReceipt {
    pub primitive: &'static str,
    pub point: Option<Point>,
    pub issued_at: DateTime<Utc>,
    pub settle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The command timed out after it was sent; the input may have landed.
    #[error("delivery unknown: {0}")]
    DeliveryUnknown(String),
}

impl From<DeviceError> for ExecError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Unreachable(reason) => Self::Unreachable(reason),
            DeviceError::Timeout(_) => Self::DeliveryUnknown(err.to_string()),
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Pause after every input before anything looks at the screen again.
    pub settle: Duration,
    /// Share of the screen a swipe travels.
    pub swipe_fraction: f64,
    pub swipe_duration: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            swipe_fraction: 0.6,
            swipe_duration: Duration::from_millis(300),
        }
    }
}

/// Issues one device input per call and waits for the UI to settle.
pub struct ActionExecutor {
    device: Arc<dyn Device>,
    settings: ExecutorSettings,
}

impl ActionExecutor {
    pub fn new(device: Arc<dyn Device>, settings: ExecutorSettings) -> Self {
        Self { device, settings }
    }

    pub async fn execute(
        &self,
        locator: Option<&ResolvedLocator>,
        primitive: &Primitive,
    ) -> Result<ExecutionReceipt, ExecError> {
        let issued_at = Utc::now();
        let point = match primitive {
            Primitive::Tap => {
                let locator = locator.ok_or_else(|| {
                    ExecError::ExecutionFailed("tap requires a resolved locator".into())
                })?;
                self.device.tap(locator.point).await?;
                Some(locator.point)
            }
            Primitive::TypeText(text) => {
                self.device.type_text(text).await?;
                None
            }
            Primitive::Swipe(direction) => {
                let screen = match locator {
                    Some(l) => l.screen,
                    None => self.device.resolution().await?,
                };
                let (from, to) = swipe_path(screen, *direction, self.settings.swipe_fraction);
                self.device
                    .swipe(from, to, self.settings.swipe_duration)
                    .await?;
                Some(from)
            }
            Primitive::Back => {
                self.device.press_back().await?;
                None
            }
        };

        tracing::debug!(primitive = primitive.name(), point = ?point, "Input issued");
        tokio::time::sleep(self.settings.settle).await;

        Ok(ExecutionReceipt {
            primitive: primitive.name(),
            point,
            issued_at,
            settle: self.settings.settle,
        })
    }
}

/// Start and end of a swipe through the middle of the screen.
fn swipe_path(screen: Resolution, direction: Direction, fraction: f64) -> (Point, Point) {
    let center = screen.center();
    let fraction = fraction.clamp(0.1, 0.9);
    let dy = (f64::from(screen.height) * fraction / 2.0).round() as i32;
    let dx = (f64::from(screen.width) * fraction / 2.0).round() as i32;
    match direction {
        Direction::Up => (
            Point::new(center.x, center.y + dy),
            Point::new(center.x, center.y - dy),
        ),
        Direction::Down => (
            Point::new(center.x, center.y - dy),
            Point::new(center.x, center.y + dy),
        ),
        Direction::Left => (
            Point::new(center.x + dx, center.y),
            Point::new(center.x - dx, center.y),
        ),
        Direction::Right => (
            Point::new(center.x - dx, center.y),
            Point::new(center.x + dx, center.y),
        ),
    }
}
