//! Admission control: per-category budgets over a sliding window, pacing
//! between actions, session halts, and the device-exclusive lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::action::{ActionAttempt, Category, Failure, Outcome};

const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub ceiling: u32,
    pub window_secs: u64,
}

impl BudgetLimit {
    pub fn per_day(ceiling: u32) -> Self {
        Self {
            ceiling,
            window_secs: 24 * 60 * 60,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Delay between consecutive actions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Chance of an occasional longer pause.
    pub long_pause_chance: f64,
    pub long_pause_factor: f64,
    /// Share of a ceiling after which delays are stretched.
    pub approach_ratio: f64,
    pub cooldown_factor: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 5_000,
            long_pause_chance: 0.1,
            long_pause_factor: 1.5,
            approach_ratio: 0.8,
            cooldown_factor: 2.0,
        }
    }
}

impl PacingConfig {
    pub fn none() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            long_pause_chance: 0.0,
            ..Self::default()
        }
    }
}

/// Which recorded attempts consume budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    #[default]
    Successes,
    Attempts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Categories without an entry are unlimited.
    pub budgets: BTreeMap<Category, BudgetLimit>,
    pub pacing: PacingConfig,
    pub count_policy: CountPolicy,
    /// Consecutive failed attempts before the session halts.
    pub halt_after_failures: u32,
    /// Charged actions allowed across all budgeted categories in any hour.
    pub hourly_limit: Option<u32>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let budgets = BTreeMap::from([
            (Category::Follow, BudgetLimit::per_day(40)),
            (Category::Message, BudgetLimit::per_day(20)),
            (Category::Repost, BudgetLimit::per_day(10)),
            (Category::StoryView, BudgetLimit::per_day(100)),
            (Category::Search, BudgetLimit::per_day(200)),
        ]);
        Self {
            budgets,
            pacing: PacingConfig::default(),
            count_policy: CountPolicy::default(),
            halt_after_failures: 5,
            hourly_limit: Some(30),
        }
    }
}

impl GuardConfig {
    /// How far back charges can still matter.
    pub fn longest_window(&self) -> Duration {
        self.budgets
            .values()
            .map(BudgetLimit::window)
            .chain(std::iter::once(HOUR))
            .max()
            .unwrap_or(HOUR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denied {
    #[error("budget_exhausted")]
    BudgetExhausted(Category),

    #[error("hourly_limit_reached")]
    HourlyLimit,

    #[error("session_halted")]
    SessionHalted,
}

/// Exclusive right to drive the device for one logical action. Dropping it
/// releases the device.
pub struct Permit {
    category: Option<Category>,
    _device: OwnedMutexGuard<()>,
}

impl Permit {
    pub fn category(&self) -> Option<Category> {
        self.category
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub used: u32,
    pub ceiling: u32,
    pub window_secs: u64,
}

/// Point-in-time view of the guard's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBudget {
    pub categories: BTreeMap<Category, CategoryUsage>,
    /// Charges across all categories in the last hour.
    #[serde(default)]
    pub hourly_used: u32,
    #[serde(default)]
    pub hourly_limit: Option<u32>,
    pub consecutive_failures: u32,
    pub halted: Option<String>,
}

#[derive(Default)]
struct BudgetState {
    charged: HashMap<Category, VecDeque<Instant>>,
    /// Every charge, for the hourly limit.
    recent: VecDeque<Instant>,
    consecutive_failures: u32,
    halted: Option<String>,
    last_action: Option<Instant>,
}

impl BudgetState {
    fn prune(&mut self, budgets: &BTreeMap<Category, BudgetLimit>, now: Instant) {
        for (category, times) in self.charged.iter_mut() {
            let Some(limit) = budgets.get(category) else {
                times.clear();
                continue;
            };
            while let Some(oldest) = times.front() {
                if now.duration_since(*oldest) >= limit.window() {
                    times.pop_front();
                } else {
                    break;
                }
            }
        }
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) >= HOUR {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn charge(&mut self, category: Category, at: Instant) {
        self.charged.entry(category).or_default().push_back(at);
        self.recent.push_back(at);
    }

    fn used(&self, category: Category) -> u32 {
        self.charged.get(&category).map_or(0, |t| t.len() as u32)
    }
}

/// The single gate in front of the device.
pub struct SessionGuard {
    config: GuardConfig,
    device: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<BudgetState>,
}

impl SessionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            device: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Waits for the device, checks the category's budget, then sleeps out
    /// the pacing delay. Never retries a denial.
    pub async fn admit(&self, category: Category) -> Result<Permit, Denied> {
        if self.is_halted() {
            return Err(Denied::SessionHalted);
        }

        let device = self.device.clone().lock_owned().await;

        let wait = {
            let mut state = self.lock_state();
            if state.halted.is_some() {
                return Err(Denied::SessionHalted);
            }
            let now = Instant::now();
            state.prune(&self.config.budgets, now);

            let used = state.used(category);
            if let Some(limit) = self.config.budgets.get(&category) {
                if used >= limit.ceiling {
                    tracing::warn!(%category, used, ceiling = limit.ceiling, "Budget exhausted");
                    return Err(Denied::BudgetExhausted(category));
                }
                if let Some(hourly) = self.config.hourly_limit {
                    let recent = state.recent.len() as u32;
                    if recent >= hourly {
                        tracing::warn!(%category, recent, hourly, "Hourly limit reached");
                        return Err(Denied::HourlyLimit);
                    }
                }
            }

            let delay = self.pacing_delay(category, used);
            state
                .last_action
                .map(|last| delay.saturating_sub(now.duration_since(last)))
                .unwrap_or(Duration::ZERO)
        };

        if !wait.is_zero() {
            tracing::debug!(%category, wait_ms = wait.as_millis() as u64, "Pacing before action");
            tokio::time::sleep(wait).await;
        }

        Ok(Permit {
            category: Some(category),
            _device: device,
        })
    }

    /// Device exclusivity without budget or pacing, for read-only probes.
    pub async fn acquire_device(&self) -> Result<Permit, Denied> {
        if self.is_halted() {
            return Err(Denied::SessionHalted);
        }
        let device = self.device.clone().lock_owned().await;
        Ok(Permit {
            category: None,
            _device: device,
        })
    }

    /// Charge a finished attempt. Denied attempts cost nothing; attempts
    /// that issued no input (e.g. already following) are not charged.
    pub fn record(&self, attempt: &ActionAttempt) {
        if attempt.failure == Some(Failure::Denied) {
            return;
        }

        let now = Instant::now();
        let mut state = self.lock_state();
        state.last_action = Some(now);

        if self.charges(attempt) {
            state.charge(attempt.category(), now);
        }

        match attempt.outcome {
            Outcome::Success => state.consecutive_failures = 0,
            Outcome::Failed | Outcome::Ambiguous => state.consecutive_failures += 1,
        }

        if attempt.failure == Some(Failure::DeviceUnreachable) {
            Self::halt_locked(&mut state, "device unreachable");
        } else if state.consecutive_failures >= self.config.halt_after_failures {
            let reason = format!("{} consecutive failures", state.consecutive_failures);
            Self::halt_locked(&mut state, &reason);
        }
    }

    /// Re-charge attempts journaled by earlier runs, so budgets hold across
    /// processes. Attempts outside every window are ignored. Returns the
    /// number of charges restored.
    pub fn restore(&self, history: &[ActionAttempt]) -> usize {
        let wall_now = Utc::now();
        let now = Instant::now();

        let mut aged: Vec<(Duration, Category)> = history
            .iter()
            .filter(|a| self.charges(a))
            .filter_map(|a| {
                let age = (wall_now - a.timestamp).to_std().unwrap_or(Duration::ZERO);
                let window = self.config.budgets.get(&a.category())?.window();
                (age < window).then_some((age, a.category()))
            })
            .collect();
        // Oldest first, so each window stays ordered.
        aged.sort_by(|a, b| b.0.cmp(&a.0));

        let mut state = self.lock_state();
        for (age, category) in &aged {
            // Ages beyond the monotonic clock's origin count as fresh.
            state.charge(*category, now.checked_sub(*age).unwrap_or(now));
        }
        for times in state.charged.values_mut() {
            times.make_contiguous().sort();
        }
        state.recent.make_contiguous().sort();
        state.prune(&self.config.budgets, now);

        tracing::info!(restored = aged.len(), "Budget restored from journal");
        aged.len()
    }

    pub fn halt(&self, reason: &str) {
        Self::halt_locked(&mut self.lock_state(), reason);
    }

    pub fn resume(&self) {
        let mut state = self.lock_state();
        if state.halted.take().is_some() {
            tracing::info!("Session resumed");
        }
        state.consecutive_failures = 0;
    }

    pub fn is_halted(&self) -> bool {
        self.lock_state().halted.is_some()
    }

    /// Drop charges that have left their window.
    pub fn roll_over(&self) {
        self.lock_state().prune(&self.config.budgets, Instant::now());
    }

    /// Periodic [`roll_over`](Self::roll_over). Stops once the guard is gone.
    pub fn spawn_rollover(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(guard) = weak.upgrade() else {
                    break;
                };
                guard.roll_over();
            }
        })
    }

    pub fn snapshot(&self) -> SessionBudget {
        let mut state = self.lock_state();
        state.prune(&self.config.budgets, Instant::now());
        let categories = self
            .config
            .budgets
            .iter()
            .map(|(category, limit)| {
                (
                    *category,
                    CategoryUsage {
                        used: state.used(*category),
                        ceiling: limit.ceiling,
                        window_secs: limit.window_secs,
                    },
                )
            })
            .collect();
        SessionBudget {
            categories,
            hourly_used: state.recent.len() as u32,
            hourly_limit: self.config.hourly_limit,
            consecutive_failures: state.consecutive_failures,
            halted: state.halted.clone(),
        }
    }

    fn pacing_delay(&self, category: Category, used: u32) -> Duration {
        let p = &self.config.pacing;
        let min = p.min_delay_ms as f64;
        let max = p.max_delay_ms.max(p.min_delay_ms) as f64;
        let mut ms = min + rand::random::<f64>() * (max - min);

        if rand::random::<f64>() < p.long_pause_chance {
            ms *= p.long_pause_factor;
        }
        if let Some(limit) = self.config.budgets.get(&category) {
            if f64::from(used) >= f64::from(limit.ceiling) * p.approach_ratio {
                tracing::info!(%category, used, ceiling = limit.ceiling, "Nearing budget, cooling down");
                ms *= p.cooldown_factor;
            }
        }
        Duration::from_millis(ms.round() as u64)
    }

    /// Charged only if input was issued, the category has a budget, and
    /// the count policy covers the outcome.
    fn charges(&self, attempt: &ActionAttempt) -> bool {
        attempt.primitives_issued > 0
            && attempt.failure != Some(Failure::Denied)
            && self.config.budgets.contains_key(&attempt.category())
            && match self.config.count_policy {
                CountPolicy::Successes => attempt.is_success(),
                CountPolicy::Attempts => true,
            }
    }

    fn halt_locked(state: &mut BudgetState, reason: &str) {
        if state.halted.is_none() {
            tracing::error!(%reason, "Session halted");
            state.halted = Some(reason.to_string());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
