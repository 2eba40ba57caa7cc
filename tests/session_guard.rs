mod common;

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

use common::{app, engine, guard_with, quiet_guard};
use gram_pilot::guard::{BudgetLimit, GuardConfig, PacingConfig};
use gram_pilot::{
    Category, Denied, Engine, Failure, JournalRecord, JsonlJournal, LocatorCatalog, LogicalAction,
    MemoryJournal, Outcome, SessionConfig,
};

#[tokio::test(start_paused = true)]
async fn exhausted_budget_denies_without_input() {
    let mut config = GuardConfig {
        pacing: PacingConfig::none(),
        ..GuardConfig::default()
    };
    config.budgets.insert(Category::Follow, BudgetLimit::per_day(1));
    let guard = guard_with(config);
    let device = Arc::new(app("jane.doe", "Follow"));
    let journal = Arc::new(MemoryJournal::new());
    let engine = engine(device.clone(), guard.clone(), journal.clone());

    engine.perform(&LogicalAction::search_user("jane.doe")).await.unwrap();
    let first = engine.perform(&LogicalAction::follow("jane.doe")).await.unwrap();
    assert!(first.is_success());
    let inputs = device.input_count();

    let second = engine.perform(&LogicalAction::follow("john")).await.unwrap();
    assert_eq!(second.outcome, Outcome::Failed);
    assert_eq!(second.failure, Some(Failure::Denied));
    assert_eq!(second.error_detail.as_deref(), Some("budget_exhausted"));
    assert_eq!(second.primitives_issued, 0);
    assert_eq!(device.input_count(), inputs);

    let budget = guard.snapshot();
    assert_eq!(budget.categories[&Category::Follow].used, 1);
    assert_eq!(budget.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_halt_the_session() {
    // Home screen with no transitions: every tab tap fails verification.
    let device = Arc::new(app("jane.doe", "Follow"));
    let journal = Arc::new(MemoryJournal::new());
    let guard = quiet_guard();
    let engine = engine(device.clone(), guard.clone(), journal.clone());

    for _ in 0..5 {
        let attempt = engine.perform(&LogicalAction::navigate_profile()).await.unwrap();
        assert_eq!(attempt.outcome, Outcome::Failed);
    }
    assert!(guard.is_halted());

    let inputs = device.input_count();
    let blocked = engine.perform(&LogicalAction::navigate_home()).await.unwrap();
    assert_eq!(blocked.failure, Some(Failure::Denied));
    assert_eq!(blocked.error_detail.as_deref(), Some("session_halted"));
    assert_eq!(device.input_count(), inputs);

    guard.resume();
    assert!(!guard.is_halted());
}

#[tokio::test(start_paused = true)]
async fn every_attempt_is_journaled_with_a_budget_record() {
    let device = Arc::new(app("jane.doe", "Follow"));
    let journal = Arc::new(MemoryJournal::new());
    let engine = engine(device, quiet_guard(), journal.clone());

    engine.perform(&LogicalAction::search_user("jane.doe")).await.unwrap();
    engine.perform(&LogicalAction::follow("jane.doe")).await.unwrap();
    engine.perform(&LogicalAction::follow("jane.doe")).await.unwrap();

    let records = journal.records();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.session_id() == engine.session_id()));
    assert!(matches!(records[0], JournalRecord::Attempt(_)));
    assert!(matches!(records[1], JournalRecord::Budget { .. }));

    let attempts = journal.attempts();
    assert_eq!(attempts.len(), 3);
    // The second follow finds the profile already followed.
    assert!(attempts[2].is_success());
    assert_eq!(attempts[2].primitives_issued, 0);
    assert_eq!(attempts[2].error_detail.as_deref(), Some("already following"));
}

#[tokio::test]
async fn daily_budget_holds_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    let config = SessionConfig {
        settle_ms: 1,
        probe_poll_ms: 1,
        probe_timeout_ms: 500,
        guard: GuardConfig {
            budgets: BTreeMap::from([(Category::Follow, BudgetLimit::per_day(1))]),
            pacing: PacingConfig::none(),
            ..GuardConfig::default()
        },
        ..SessionConfig::default()
    };

    {
        let engine = Engine::new(
            Arc::new(app("jane.doe", "Follow")),
            Arc::new(LocatorCatalog::builtin().unwrap()),
            guard_with(config.guard.clone()),
            Arc::new(JsonlJournal::open(&path).await.unwrap()),
            &config,
        );
        engine.perform(&LogicalAction::search_user("jane.doe")).await.unwrap();
        assert!(engine.perform(&LogicalAction::follow("jane.doe")).await.unwrap().is_success());
    }

    // A later run starts from an empty guard and the same journal.
    let journal = JsonlJournal::open(&path).await.unwrap();
    let since = Utc::now() - chrono::Duration::from_std(config.guard.longest_window()).unwrap();
    let history = journal.history(since).await.unwrap();
    let guard = guard_with(config.guard.clone());
    assert_eq!(guard.restore(&history), 1);

    assert_eq!(
        guard.admit(Category::Follow).await.unwrap_err(),
        Denied::BudgetExhausted(Category::Follow)
    );
}
