//! Errors that end a logical action instead of being reported as an outcome.
//!
//! Everything else (no candidate, rejected input, failed verification,
//! budget denial) is a typed [`Failure`](crate::action::Failure) on the
//! returned attempt, so callers can build their own retry policies.

use thiserror::Error;

use crate::catalog::Target;

/// Non-recoverable conditions within a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The catalog has no strategy at all for this target. A configuration
    /// error: never retried.
    #[error("unresolvable target: {0}")]
    UnresolvableTarget(Target),

    /// The device transport is gone. The session is halted and has to be
    /// re-established.
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    /// The guard has halted the session; nothing reaches the device until
    /// it is resumed.
    #[error("session halted")]
    SessionHalted,

    #[error("screenshot failed: {0}")]
    Screenshot(String),
}

impl EngineError {
    /// Short machine-readable label, printed by the CLI when a command fails.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvableTarget(_) => "unresolvable_target",
            Self::DeviceUnreachable(_) => "device_unreachable",
            Self::SessionHalted => "session_halted",
            Self::Screenshot(_) => "screenshot_failed",
        }
    }
}
