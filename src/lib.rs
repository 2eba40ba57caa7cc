//! # gram-pilot
//!
//! Action resolution and verification for driving a mobile app's UI over
//! an ADB-style device channel.
//!
//! A caller asks for a [`LogicalAction`] ("follow this profile", "send this
//! message"). The [`Engine`] turns it into device input:
//!
//! 1. [`SessionGuard`] admits the action against the session budget and
//!    takes exclusive access to the device.
//! 2. [`DeviceProbe`] captures a [`DeviceSnapshot`] of the UI hierarchy.
//! 3. [`LocatorResolver`] picks the most reliable [`LocatorStrategy`] from
//!    the [`LocatorCatalog`] that applies to that snapshot.
//! 4. [`ActionExecutor`] issues exactly one input primitive and waits for
//!    the UI to settle.
//! 5. [`OutcomeVerifier`] re-probes and checks the step's post-condition.
//! 6. The resulting [`ActionAttempt`] is appended to the [`Journal`] and
//!    charged against the budget.
//!
//! Follows are gated by [`FollowStateMachine`]: an existing relationship is
//! never touched.

pub mod action;
pub mod analysis;
pub mod catalog;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod executor;
pub mod filter;
pub mod follow;
pub mod guard;
pub mod journal;
pub mod lock;
pub mod probe;
pub mod resolver;
pub mod snapshot;
pub mod verifier;
pub mod workflow;

pub use action::{
    ActionAttempt, ActionKind, Category, Failure, LogicalAction, Outcome, Step, StrategyUsed,
};
pub use analysis::{Analysis, AnalysisError, AnalysisRequest, Analyzer, OpenAiAnalyzer, TaskKind};
pub use catalog::{CatalogError, LocatorCatalog, LocatorStrategy, StrategyKind, Target};
pub use config::{ConfigError, SessionConfig};
pub use device::{AdbDevice, Device, DeviceError, DeviceEvent, ScriptedDevice};
pub use engine::Engine;
pub use error::EngineError;
pub use executor::{ActionExecutor, Direction, ExecutionReceipt, ExecutorSettings, Primitive};
pub use filter::ContentFilter;
pub use follow::{FollowStateMachine, RelationshipState};
pub use guard::{
    BudgetLimit, CountPolicy, Denied, GuardConfig, PacingConfig, Permit, SessionBudget, SessionGuard,
};
pub use journal::{Journal, JournalRecord, JsonlJournal, MemoryJournal};
pub use lock::{DeviceLock, LockError};
pub use probe::{DeviceProbe, ProbeSettings};
pub use resolver::{LocatorResolver, ResolveError, ResolvedLocator};
pub use snapshot::{Bounds, DeviceSnapshot, Point, Resolution, UiElement};
pub use verifier::{OutcomeVerifier, PostCondition};
