//! admit → resolve → execute → verify → retry → journal → charge.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::action::{
    ActionAttempt, ActionKind, Category, Failure, LogicalAction, Outcome, Step, StrategyUsed,
};
use crate::analysis::{Analysis, AnalysisRequest, Analyzer, TaskKind};
use crate::catalog::{LocatorCatalog, StrategyKind, Target};
use crate::config::SessionConfig;
use crate::device::{Device, DeviceError};
use crate::error::EngineError;
use crate::executor::{ActionExecutor, ExecError};
use crate::filter::ContentFilter;
use crate::follow::{FollowStateMachine, RelationshipState};
use crate::guard::SessionGuard;
use crate::journal::{Journal, JournalRecord};
use crate::probe::DeviceProbe;
use crate::resolver::{self, LocatorResolver, ResolveError, ResolvedLocator};
use crate::snapshot::DeviceSnapshot;
use crate::verifier::OutcomeVerifier;

/// How a step, or the whole action, ended.
enum StepEnd {
    Done,
    Failed(Failure, String),
    Fatal(EngineError),
}

/// Mutable tally for the attempt being built.
#[derive(Default)]
struct Tally {
    strategy: Option<StrategyUsed>,
    primitives: u32,
    note: Option<String>,
}

/// Drives logical actions against one device session.
pub struct Engine {
    session_id: Uuid,
    probe: DeviceProbe,
    resolver: LocatorResolver,
    executor: ActionExecutor,
    guard: Arc<SessionGuard>,
    journal: Arc<dyn Journal>,
    analyzer: Option<Arc<dyn Analyzer>>,
    filter: ContentFilter,
    max_strategy_attempts: u32,
}

impl Engine {
    pub fn new(
        device: Arc<dyn Device>,
        catalog: Arc<LocatorCatalog>,
        guard: Arc<SessionGuard>,
        journal: Arc<dyn Journal>,
        config: &SessionConfig,
    ) -> Self {
        let session_id = Uuid::new_v4();
        tracing::info!(%session_id, catalog = catalog.version(), "Engine session started");
        Self {
            session_id,
            probe: DeviceProbe::new(device.clone(), config.probe_settings()),
            resolver: LocatorResolver::new(catalog),
            executor: ActionExecutor::new(device, config.executor_settings()),
            guard,
            journal,
            analyzer: None,
            filter: ContentFilter::with_extra(&config.blocked_words),
            max_strategy_attempts: config.max_strategy_attempts.max(1),
        }
    }

    /// Enable the vision strategy as a last resort.
    pub fn with_vision(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn guard(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    /// Run one logical action to completion. Always journals exactly one
    /// attempt; only an unreachable device or an unresolvable target come
    /// back as `Err`.
    pub async fn perform(&self, action: &LogicalAction) -> Result<ActionAttempt, EngineError> {
        let started = Instant::now();
        let category = action.category();

        if let Some(blocked) = self.screen_message(action) {
            tracing::warn!(action = %action.kind(), words = ?blocked, "Message blocked by content filter");
            let detail = format!("blocked words: {}", blocked.join(", "));
            let end = StepEnd::Failed(Failure::ContentBlocked, detail);
            let attempt = self.build_attempt(action, started, Tally::default(), end);
            self.journal_attempt(&attempt).await;
            return Ok(attempt);
        }

        let permit = match self.guard.admit(category).await {
            Ok(permit) => permit,
            Err(denied) => {
                tracing::info!(action = %action.kind(), %category, reason = %denied, "Action denied");
                let attempt = self.build_attempt(
                    action,
                    started,
                    Tally::default(),
                    StepEnd::Failed(Failure::Denied, denied.to_string()),
                );
                self.journal_attempt(&attempt).await;
                return Ok(attempt);
            }
        };

        let mut tally = Tally::default();
        let end = if action.kind() == ActionKind::Follow {
            self.run_follow(action, &mut tally).await
        } else {
            self.run_steps(action.steps(), &mut tally).await
        };

        let fatal = match &end {
            StepEnd::Fatal(e) => Some(e.clone()),
            _ => None,
        };
        let attempt = self.build_attempt(action, started, tally, end);

        self.guard.record(&attempt);
        self.journal_attempt(&attempt).await;
        drop(permit);

        match fatal {
            Some(e) => Err(e),
            None => Ok(attempt),
        }
    }

    /// Current relationship with the profile on screen. Read-only: no
    /// budget is charged and nothing is tapped. The read is journaled like
    /// any other attempt; Unknown is recorded as `state_indeterminate`.
    pub async fn check_follow_status(&self) -> Result<RelationshipState, EngineError> {
        let started = Instant::now();
        let action = LogicalAction::check_follow_status();

        let _permit = match self.guard.acquire_device().await {
            Ok(permit) => permit,
            Err(denied) => {
                let end = StepEnd::Failed(Failure::Denied, denied.to_string());
                self.journal_attempt(&self.build_attempt(&action, started, Tally::default(), end))
                    .await;
                return Err(EngineError::SessionHalted);
            }
        };

        let mut tally = Tally::default();
        let (result, end) = match self.probe.snapshot().await {
            Ok(snapshot) => {
                let state = FollowStateMachine::derive(&snapshot);
                tracing::info!(session_id = %self.session_id, %state, "Follow status checked");
                let end = if state == RelationshipState::Unknown {
                    StepEnd::Failed(Failure::StateIndeterminate, "no follow button or label".into())
                } else {
                    tally.note = Some(state.to_string());
                    StepEnd::Done
                };
                (Ok(state), end)
            }
            Err(DeviceError::Unreachable(reason)) => {
                self.guard.halt("device unreachable");
                let err = EngineError::DeviceUnreachable(reason);
                (Err(err.clone()), StepEnd::Fatal(err))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not read profile, follow status unknown");
                let end = StepEnd::Failed(Failure::StateIndeterminate, e.to_string());
                (Ok(RelationshipState::Unknown), end)
            }
        };

        self.journal_attempt(&self.build_attempt(&action, started, tally, end))
            .await;
        result
    }

    /// Blocked words in the text a message action would type.
    fn screen_message(&self, action: &LogicalAction) -> Option<Vec<String>> {
        if action.category() != Category::Message {
            return None;
        }
        let blocked: Vec<String> = action
            .typed_text()
            .flat_map(|text| self.filter.blocked_words(text))
            .collect();
        (!blocked.is_empty()).then_some(blocked)
    }

    /// Screenshot for out-of-band analysis.
    pub async fn capture_screenshot(&self) -> Result<Vec<u8>, EngineError> {
        let _permit = self
            .guard
            .acquire_device()
            .await
            .map_err(|_| EngineError::SessionHalted)?;
        self.probe.screenshot().await.map_err(|e| match e {
            DeviceError::Unreachable(reason) => {
                self.guard.halt("device unreachable");
                EngineError::DeviceUnreachable(reason)
            }
            other => EngineError::Screenshot(other.to_string()),
        })
    }

    async fn run_steps(&self, steps: &[Step], tally: &mut Tally) -> StepEnd {
        for (i, step) in steps.iter().enumerate() {
            match self.run_step(step, tally).await {
                StepEnd::Done => continue,
                StepEnd::Failed(failure, detail) => {
                    return StepEnd::Failed(failure, format!("step {}/{}: {detail}", i + 1, steps.len()));
                }
                fatal @ StepEnd::Fatal(_) => return fatal,
            }
        }
        StepEnd::Done
    }

    /// One step, trying successive strategies against fresh snapshots.
    async fn run_step(&self, step: &Step, tally: &mut Tally) -> StepEnd {
        let mut tried: Vec<usize> = Vec::new();
        let mut last = (Failure::NoCandidate, "no strategy was tried".to_string());

        for _ in 0..self.max_strategy_attempts {
            let before = match self.fresh_snapshot().await {
                Ok(s) => s,
                Err(end @ StepEnd::Fatal(_)) => return end,
                Err(StepEnd::Failed(f, d)) => {
                    last = (f, d);
                    continue;
                }
                Err(StepEnd::Done) => continue,
            };

            let locator = match step.target {
                None => None,
                Some(target) => match self.locate(target, &before, &tried).await {
                    Ok(l) => {
                        tried.push(l.index);
                        Some(l)
                    }
                    Err(end @ StepEnd::Fatal(_)) => return end,
                    Err(StepEnd::Failed(f, d)) => {
                        last = (f, d);
                        continue;
                    }
                    Err(StepEnd::Done) => continue,
                },
            };

            match self.deliver_and_verify(step, locator.as_ref(), &before, tally).await {
                StepEnd::Done => return StepEnd::Done,
                fatal @ StepEnd::Fatal(_) => return fatal,
                StepEnd::Failed(f, d) => {
                    // Only a rejected input is known not to have reached the app.
                    let delivered = f != Failure::ExecutionFailed;
                    last = (f, d);
                    if delivered && !step.idempotent {
                        break;
                    }
                }
            }
        }

        StepEnd::Failed(last.0, last.1)
    }

    /// Re-derives the relationship before every try and taps only while it
    /// reads `NotFollowing`.
    async fn run_follow(&self, action: &LogicalAction, tally: &mut Tally) -> StepEnd {
        let Some(step) = action.steps().first() else {
            return StepEnd::Done;
        };
        let mut tried: Vec<usize> = Vec::new();
        let mut last = (Failure::NoCandidate, "no strategy was tried".to_string());

        for _ in 0..self.max_strategy_attempts {
            let before = match self.fresh_snapshot().await {
                Ok(s) => s,
                Err(end @ StepEnd::Fatal(_)) => return end,
                Err(StepEnd::Failed(f, d)) => {
                    last = (f, d);
                    continue;
                }
                Err(StepEnd::Done) => continue,
            };

            match FollowStateMachine::derive(&before) {
                RelationshipState::NotFollowing => {}
                RelationshipState::Unknown => {
                    return StepEnd::Failed(Failure::StateIndeterminate, "state_indeterminate".into());
                }
                state => {
                    tracing::info!(user = ?action.parameter(), %state, "Already connected, not tapping");
                    if tally.primitives == 0 {
                        tally.note = Some(format!("already {state}"));
                    }
                    return StepEnd::Done;
                }
            }

            let locator = match self.locate(Target::FollowButton, &before, &tried).await {
                Ok(l) => {
                    tried.push(l.index);
                    l
                }
                Err(end @ StepEnd::Fatal(_)) => return end,
                Err(StepEnd::Failed(f, d)) => {
                    last = (f, d);
                    continue;
                }
                Err(StepEnd::Done) => continue,
            };

            match self.deliver_and_verify(step, Some(&locator), &before, tally).await {
                StepEnd::Done => return StepEnd::Done,
                fatal @ StepEnd::Fatal(_) => return fatal,
                StepEnd::Failed(f, d) => last = (f, d),
            }
        }

        StepEnd::Failed(last.0, last.1)
    }

    async fn deliver_and_verify(
        &self,
        step: &Step,
        locator: Option<&ResolvedLocator>,
        before: &DeviceSnapshot,
        tally: &mut Tally,
    ) -> StepEnd {
        if let Some(l) = locator {
            tally.strategy = Some(StrategyUsed {
                target: l.target,
                kind: l.kind,
                index: l.index,
            });
        }

        match self.executor.execute(locator, &step.primitive).await {
            Ok(_) => tally.primitives += 1,
            Err(ExecError::Unreachable(reason)) => {
                return StepEnd::Fatal(EngineError::DeviceUnreachable(reason));
            }
            Err(ExecError::ExecutionFailed(reason)) => {
                tracing::warn!(primitive = step.primitive.name(), %reason, "Input rejected");
                return StepEnd::Failed(Failure::ExecutionFailed, reason);
            }
            Err(ExecError::DeliveryUnknown(reason)) => {
                tracing::warn!(primitive = step.primitive.name(), %reason, "Input may have landed");
                tally.primitives += 1;
                return StepEnd::Failed(Failure::DeliveryUnknown, reason);
            }
        }

        let after = match self.fresh_snapshot().await {
            Ok(s) => s,
            Err(end) => return end,
        };

        match OutcomeVerifier::verify_settled(&step.expect, before, after, &self.probe).await {
            Ok((Outcome::Success, _)) => StepEnd::Done,
            Ok((outcome, _)) => {
                tracing::debug!(expect = ?step.expect, %outcome, "Post-condition not met");
                StepEnd::Failed(
                    Failure::VerificationFailed,
                    format!("expected {:?} after {}", step.expect, step.primitive.name()),
                )
            }
            Err(e) => device_failure(e),
        }
    }

    /// Resolve through the catalog, then the vision fallback if attached.
    async fn locate(
        &self,
        target: Target,
        snapshot: &DeviceSnapshot,
        tried: &[usize],
    ) -> Result<ResolvedLocator, StepEnd> {
        match self.resolver.resolve_excluding(target, snapshot, tried) {
            Ok(l) => Ok(l),
            Err(ResolveError::UnresolvableTarget(t)) => {
                Err(StepEnd::Fatal(EngineError::UnresolvableTarget(t)))
            }
            Err(ResolveError::NoCandidate(t)) => match self.locate_by_vision(t, snapshot, tried).await {
                Some(l) => Ok(l),
                None => Err(StepEnd::Failed(
                    Failure::NoCandidate,
                    format!("no strategy for {t} applies to the current screen"),
                )),
            },
        }
    }

    async fn locate_by_vision(
        &self,
        target: Target,
        snapshot: &DeviceSnapshot,
        tried: &[usize],
    ) -> Option<ResolvedLocator> {
        let analyzer = self.analyzer.as_ref()?;
        let (index, description) = self.resolver.vision_fallback(target, tried)?;

        let png = match self.probe.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!(%target, error = %e, "Screenshot for vision fallback failed");
                return None;
            }
        };
        let request = AnalysisRequest::image(TaskKind::LocateElement, png)
            .with_context(format!("Element: {description}"));

        match analyzer.analyze(request).await {
            Ok(Analysis::Location(loc)) if loc.found => {
                let point = resolver::to_pixels(loc.x, loc.y, snapshot.resolution);
                tracing::info!(%target, %point, "Located by vision");
                Some(ResolvedLocator {
                    target,
                    index,
                    kind: StrategyKind::Vision,
                    point,
                    screen: snapshot.resolution,
                })
            }
            Ok(_) => {
                tracing::info!(%target, "Vision did not find the element");
                None
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "Vision fallback failed");
                None
            }
        }
    }

    async fn fresh_snapshot(&self) -> Result<DeviceSnapshot, StepEnd> {
        self.probe.snapshot().await.map_err(device_failure)
    }

    fn build_attempt(
        &self,
        action: &LogicalAction,
        started: Instant,
        tally: Tally,
        end: StepEnd,
    ) -> ActionAttempt {
        let (outcome, failure, error_detail) = match end {
            StepEnd::Done => (Outcome::Success, None, tally.note),
            StepEnd::Failed(f, detail) => (Outcome::Failed, Some(f), Some(detail)),
            StepEnd::Fatal(e) => {
                let failure = match e {
                    EngineError::UnresolvableTarget(_) => Failure::UnresolvableTarget,
                    EngineError::SessionHalted => Failure::Denied,
                    EngineError::DeviceUnreachable(_) | EngineError::Screenshot(_) => {
                        Failure::DeviceUnreachable
                    }
                };
                (Outcome::Failed, Some(failure), Some(e.to_string()))
            }
        };

        ActionAttempt {
            session_id: self.session_id,
            timestamp: Utc::now(),
            logical_action: action.kind(),
            parameter: action.parameter().map(str::to_string),
            strategy_used: tally.strategy,
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            error_detail,
            failure,
            primitives_issued: tally.primitives,
        }
    }

    /// Write the attempt and the budget it leaves behind. A journal failure
    /// is logged; the attempt is still returned to the caller.
    async fn journal_attempt(&self, attempt: &ActionAttempt) {
        tracing::info!(
            session_id = %self.session_id,
            action = %attempt.logical_action,
            strategy = attempt.strategy_used.as_ref().map(|s| s.to_string()).unwrap_or_default(),
            outcome = %attempt.outcome,
            failure = attempt.failure.map(|f| f.to_string()).unwrap_or_default(),
            latency_ms = attempt.latency_ms,
            primitives = attempt.primitives_issued,
            "Action attempt"
        );

        if let Err(e) = self.journal.append(JournalRecord::Attempt(attempt.clone())).await {
            tracing::error!(session_id = %self.session_id, error = %e, "Failed to journal attempt");
        }
        let budget = JournalRecord::Budget {
            session_id: self.session_id,
            timestamp: Utc::now(),
            usage: self.guard.snapshot(),
        };
        if let Err(e) = self.journal.append(budget).await {
            tracing::error!(session_id = %self.session_id, error = %e, "Failed to journal budget");
        }
    }
}

fn device_failure(err: DeviceError) -> StepEnd {
    match err {
        DeviceError::Unreachable(reason) => StepEnd::Fatal(EngineError::DeviceUnreachable(reason)),
        DeviceError::Timeout(_) => StepEnd::Failed(Failure::Timeout, err.to_string()),
        other => StepEnd::Failed(Failure::ExecutionFailed, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ids;
    use crate::device::{DeviceEvent, ScriptedDevice};
    use crate::guard::{BudgetLimit, GuardConfig, PacingConfig};
    use crate::journal::MemoryJournal;
    use crate::snapshot::{Bounds, Point, Resolution, UiElement};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    const FHD: Resolution = Resolution::new(1080, 2400);

    fn quiet_guard() -> Arc<SessionGuard> {
        Arc::new(SessionGuard::new(GuardConfig {
            pacing: PacingConfig::none(),
            ..GuardConfig::default()
        }))
    }

    fn engine(device: Arc<ScriptedDevice>, journal: Arc<MemoryJournal>) -> Engine {
        Engine::new(
            device,
            Arc::new(LocatorCatalog::builtin().unwrap()),
            quiet_guard(),
            journal,
            &SessionConfig::default(),
        )
    }

    fn follow_button(label: &str) -> UiElement {
        UiElement::new("android.widget.Button")
            .with_id(ids::FOLLOW_BUTTON)
            .with_text(label)
            .with_bounds(40, 370, 520, 430)
            .clickable()
    }

    fn profile(label: &str) -> Vec<UiElement> {
        vec![
            UiElement::new("android.widget.LinearLayout")
                .with_id(ids::PROFILE_HEADER)
                .with_bounds(0, 200, 1080, 500),
            follow_button(label),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn follow_taps_once_and_verifies() {
        let device = Arc::new(
            ScriptedDevice::new(FHD, "profile", profile("Follow"))
                .with_screen("followed", profile("Following"))
                .with_tap("profile", Bounds::new(40, 370, 520, 430), "followed"),
        );
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine(device.clone(), journal.clone());

        let attempt = engine.perform(&LogicalAction::follow("jane")).await.unwrap();
        assert_eq!(attempt.outcome, Outcome::Success);
        assert_eq!(attempt.primitives_issued, 1);
        assert_eq!(device.events(), vec![DeviceEvent::Tap(Point::new(280, 400))]);
        assert_eq!(
            attempt.strategy_used,
            Some(StrategyUsed {
                target: Target::FollowButton,
                kind: StrategyKind::SemanticId,
                index: 0
            })
        );
        assert_eq!(journal.attempts().len(), 1);
        assert_eq!(engine.guard().snapshot().categories[&crate::action::Category::Follow].used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requested_profile_is_left_alone() {
        let device = Arc::new(ScriptedDevice::new(FHD, "profile", profile("Requested")));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine(device.clone(), journal.clone());

        let attempt = engine.perform(&LogicalAction::follow("jane")).await.unwrap();
        assert!(attempt.is_success());
        assert_eq!(attempt.primitives_issued, 0);
        assert_eq!(attempt.error_detail.as_deref(), Some("already requested"));
        assert_eq!(device.input_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_state_is_never_guessed() {
        let device = Arc::new(ScriptedDevice::new(FHD, "profile", profile("Edit profile")));
        let engine = engine(device.clone(), Arc::new(MemoryJournal::new()));

        let attempt = engine.perform(&LogicalAction::follow("jane")).await.unwrap();
        assert_eq!(attempt.outcome, Outcome::Failed);
        assert_eq!(attempt.failure, Some(Failure::StateIndeterminate));
        assert_eq!(attempt.error_detail.as_deref(), Some("state_indeterminate"));
        assert_eq!(device.input_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verification_moves_to_the_next_strategy() {
        // The id-matched element does nothing; the guarded coordinate works.
        let home = vec![
            UiElement::new("android.widget.FrameLayout")
                .with_id(ids::SEARCH_TAB)
                .with_bounds(0, 0, 100, 100),
        ];
        let search = vec![
            UiElement::new("android.widget.FrameLayout")
                .with_id(ids::SEARCH_TAB)
                .with_bounds(0, 0, 100, 100)
                .selected(),
        ];
        let device = Arc::new(
            ScriptedDevice::new(FHD, "home", home)
                .with_screen("search", search)
                .with_tap("home", Bounds::new(216, 2148, 432, 2182), "search"),
        );
        let engine = engine(device.clone(), Arc::new(MemoryJournal::new()));

        let attempt = engine.perform(&LogicalAction::navigate_search()).await.unwrap();
        assert!(attempt.is_success());
        assert_eq!(attempt.primitives_issued, 2);
        assert_eq!(attempt.strategy_used.unwrap().kind, StrategyKind::NormalizedCoordinate);
    }

    #[tokio::test(start_paused = true)]
    async fn irreversible_step_is_not_repeated() {
        let thread = vec![
            UiElement::new("android.widget.EditText")
                .with_id(ids::COMPOSER_INPUT)
                .with_text("hi")
                .focused(),
            UiElement::new("android.widget.ImageView")
                .with_id(ids::COMPOSER_SEND)
                .with_bounds(900, 2200, 1000, 2300)
                .clickable(),
        ];
        let device = Arc::new(ScriptedDevice::new(FHD, "thread", thread));
        let engine = engine(device.clone(), Arc::new(MemoryJournal::new()));

        let action = LogicalAction::send_message("jane", "hi");
        let send = action.steps().last().unwrap();
        let mut tally = Tally::default();
        let end = engine.run_step(send, &mut tally).await;

        assert!(matches!(end, StepEnd::Failed(Failure::VerificationFailed, _)));
        assert_eq!(device.input_count(), 1);
    }

    /// Taps land on the inner device, but the command reports a timeout.
    struct SlowTaps(Arc<ScriptedDevice>);

    #[async_trait]
    impl Device for SlowTaps {
        async fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
            self.0.snapshot().await
        }
        async fn resolution(&self) -> Result<Resolution, DeviceError> {
            self.0.resolution().await
        }
        async fn tap(&self, at: Point) -> Result<(), DeviceError> {
            self.0.tap(at).await?;
            Err(DeviceError::Timeout(std::time::Duration::from_secs(10)))
        }
        async fn type_text(&self, text: &str) -> Result<(), DeviceError> {
            self.0.type_text(text).await
        }
        async fn swipe(
            &self,
            from: Point,
            to: Point,
            duration: std::time::Duration,
        ) -> Result<(), DeviceError> {
            self.0.swipe(from, to, duration).await
        }
        async fn press_back(&self) -> Result<(), DeviceError> {
            self.0.press_back().await
        }
        async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
            self.0.screenshot().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_send_is_not_pressed_again() {
        let thread = vec![
            UiElement::new("android.widget.EditText")
                .with_id(ids::COMPOSER_INPUT)
                .with_text("hi")
                .focused(),
            UiElement::new("android.widget.ImageView")
                .with_id(ids::COMPOSER_SEND)
                .with_bounds(900, 2200, 1000, 2300)
                .clickable(),
            UiElement::new("android.widget.TextView")
                .with_text("Send")
                .with_bounds(700, 2200, 880, 2300)
                .clickable(),
        ];
        let inner = Arc::new(ScriptedDevice::new(FHD, "thread", thread));
        let engine = Engine::new(
            Arc::new(SlowTaps(inner.clone())),
            Arc::new(LocatorCatalog::builtin().unwrap()),
            quiet_guard(),
            Arc::new(MemoryJournal::new()),
            &SessionConfig::default(),
        );

        let action = LogicalAction::send_message("jane", "hi");
        let send = action.steps().last().unwrap();
        let mut tally = Tally::default();
        let end = engine.run_step(send, &mut tally).await;

        assert!(matches!(end, StepEnd::Failed(Failure::DeliveryUnknown, _)));
        assert_eq!(inner.input_count(), 1);
        assert_eq!(tally.primitives, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_candidate_is_logged_without_touching_the_device() {
        let device = Arc::new(ScriptedDevice::new(Resolution::new(720, 1600), "home", vec![]));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine(device.clone(), journal.clone());

        let attempt = engine.perform(&LogicalAction::navigate_home()).await.unwrap();
        assert_eq!(attempt.failure, Some(Failure::NoCandidate));
        assert_eq!(device.input_count(), 0);
        assert_eq!(journal.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_is_logged_and_propagated() {
        let device = Arc::new(ScriptedDevice::new(FHD, "home", vec![]));
        device.set_unreachable(true);
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine(device, journal.clone());

        let err = engine.perform(&LogicalAction::navigate_home()).await.unwrap_err();
        assert!(matches!(err, EngineError::DeviceUnreachable(_)));
        assert_eq!(journal.attempts().len(), 1);
        assert_eq!(journal.attempts()[0].failure, Some(Failure::DeviceUnreachable));
        assert!(engine.guard().is_halted());

        let attempt = engine.perform(&LogicalAction::navigate_home()).await.unwrap();
        assert_eq!(attempt.failure, Some(Failure::Denied));
        assert_eq!(journal.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_target_is_fatal_for_the_action() {
        let device = Arc::new(ScriptedDevice::new(FHD, "home", vec![]));
        let journal = Arc::new(MemoryJournal::new());
        let catalog = LocatorCatalog::from_json(r#"{"version": "empty", "targets": {}}"#).unwrap();
        let engine = Engine::new(
            device,
            Arc::new(catalog),
            quiet_guard(),
            journal.clone(),
            &SessionConfig::default(),
        );

        let err = engine.perform(&LogicalAction::navigate_home()).await.unwrap_err();
        assert_eq!(err, EngineError::UnresolvableTarget(Target::HomeTab));
        assert_eq!(journal.attempts()[0].failure, Some(Failure::UnresolvableTarget));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_action_is_journaled_but_free() {
        let device = Arc::new(ScriptedDevice::new(FHD, "profile", profile("Follow")));
        let journal = Arc::new(MemoryJournal::new());
        let guard = Arc::new(SessionGuard::new(GuardConfig {
            budgets: BTreeMap::from([(crate::action::Category::Follow, BudgetLimit::per_day(0))]),
            pacing: PacingConfig::none(),
            ..GuardConfig::default()
        }));
        let engine = Engine::new(
            device.clone(),
            Arc::new(LocatorCatalog::builtin().unwrap()),
            guard,
            journal.clone(),
            &SessionConfig::default(),
        );

        let attempt = engine.perform(&LogicalAction::follow("jane")).await.unwrap();
        assert_eq!(attempt.failure, Some(Failure::Denied));
        assert_eq!(attempt.error_detail.as_deref(), Some("budget_exhausted"));
        assert_eq!(device.input_count(), 0);
        assert_eq!(journal.attempts().len(), 1);
    }

    struct PointsAt(f64, f64);

    #[async_trait]
    impl Analyzer for PointsAt {
        async fn analyze(
            &self,
            request: AnalysisRequest,
        ) -> Result<Analysis, crate::analysis::AnalysisError> {
            assert_eq!(request.task, TaskKind::LocateElement);
            Ok(Analysis::Location(crate::analysis::ElementLocation {
                found: true,
                x: self.0,
                y: self.1,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn vision_is_the_last_resort() {
        // Unfamiliar resolution, no ids and no text: only vision can help.
        let res = Resolution::new(1000, 2000);
        let ring = vec![UiElement::new("android.widget.ImageView").with_bounds(40, 300, 240, 500)];
        let viewer = vec![UiElement::new("android.widget.FrameLayout").with_id(ids::REEL_VIEWER)];
        let device = Arc::new(
            ScriptedDevice::new(res, "profile", ring)
                .with_screen("viewer", viewer)
                .with_tap("profile", Bounds::new(40, 300, 240, 500), "viewer"),
        );
        let engine = engine(device.clone(), Arc::new(MemoryJournal::new()))
            .with_vision(Arc::new(PointsAt(0.14, 0.2)));

        let attempt = engine.perform(&LogicalAction::view_story("jane")).await.unwrap();
        assert!(attempt.is_success());
        assert_eq!(attempt.strategy_used.unwrap().kind, StrategyKind::Vision);
        assert_eq!(device.events(), vec![DeviceEvent::Tap(Point::new(140, 400))]);
    }

    #[tokio::test(start_paused = true)]
    async fn check_follow_status_reads_without_input() {
        let device = Arc::new(ScriptedDevice::new(FHD, "profile", profile("Following")));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine(device.clone(), journal.clone());

        assert_eq!(engine.check_follow_status().await.unwrap(), RelationshipState::Following);
        assert_eq!(device.input_count(), 0);

        let attempts = journal.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].logical_action, ActionKind::CheckFollowStatus);
        assert!(attempts[0].is_success());
        assert_eq!(attempts[0].error_detail.as_deref(), Some("following"));
        assert_eq!(attempts[0].primitives_issued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_reads_are_journaled() {
        let device = Arc::new(ScriptedDevice::new(FHD, "profile", Vec::new()));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine(device.clone(), journal.clone());

        assert_eq!(engine.check_follow_status().await.unwrap(), RelationshipState::Unknown);
        device.set_unreachable(true);
        let err = engine.check_follow_status().await.unwrap_err();
        assert!(matches!(err, EngineError::DeviceUnreachable(_)));
        assert_eq!(engine.check_follow_status().await.unwrap_err(), EngineError::SessionHalted);

        let failures: Vec<_> = journal.attempts().iter().map(|a| a.failure).collect();
        assert_eq!(
            failures,
            vec![
                Some(Failure::StateIndeterminate),
                Some(Failure::DeviceUnreachable),
                Some(Failure::Denied),
            ]
        );
        assert!(journal.attempts().iter().all(|a| a.outcome == Outcome::Failed));
    }
}
