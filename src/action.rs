//! Caller-level intents and the record of each attempt to carry one out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::catalog::{ids, StrategyKind, Target};
use crate::executor::Primitive;
use crate::follow::RelationshipState;
use crate::verifier::PostCondition;

/// Budget bucket an action is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Navigation,
    Search,
    Follow,
    StoryView,
    Repost,
    Message,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Search => "search",
            Self::Follow => "follow",
            Self::StoryView => "story_view",
            Self::Repost => "repost",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "navigation" => Ok(Self::Navigation),
            "search" => Ok(Self::Search),
            "follow" => Ok(Self::Follow),
            "story_view" => Ok(Self::StoryView),
            "repost" => Ok(Self::Repost),
            "message" => Ok(Self::Message),
            other => Err(format!("unknown category {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    NavigateHome,
    NavigateSearch,
    NavigateProfile,
    SearchUser,
    Follow,
    ViewStory,
    Repost,
    SendMessage,
    NextStory,
    GoBack,
    /// Read-only relationship check; never issues input.
    CheckFollowStatus,
}

impl ActionKind {
    pub fn category(&self) -> Category {
        match self {
            Self::NavigateHome
            | Self::NavigateSearch
            | Self::NavigateProfile
            | Self::GoBack
            | Self::CheckFollowStatus => Category::Navigation,
            Self::SearchUser => Category::Search,
            Self::Follow => Category::Follow,
            Self::ViewStory | Self::NextStory => Category::StoryView,
            Self::Repost => Category::Repost,
            Self::SendMessage => Category::Message,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigateHome => "navigate_home",
            Self::NavigateSearch => "navigate_search",
            Self::NavigateProfile => "navigate_profile",
            Self::SearchUser => "search_user",
            Self::Follow => "follow",
            Self::ViewStory => "view_story",
            Self::Repost => "repost",
            Self::SendMessage => "send_message",
            Self::NextStory => "next_story",
            Self::GoBack => "go_back",
            Self::CheckFollowStatus => "check_follow_status",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One input event and the state it should produce.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// `None` for primitives that need no on-screen location (back key).
    pub target: Option<Target>,
    pub primitive: Primitive,
    pub expect: PostCondition,
    /// Whether the primitive may be issued a second time after it was
    /// delivered but not confirmed.
    pub idempotent: bool,
}

impl Step {
    fn tap(target: Target, expect: PostCondition) -> Self {
        Self {
            target: Some(target),
            primitive: Primitive::Tap,
            expect,
            idempotent: true,
        }
    }

    fn once(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// An intent, immutable once built, together with the steps that realise it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalAction {
    kind: ActionKind,
    parameter: Option<String>,
    steps: Vec<Step>,
}

impl LogicalAction {
    pub fn navigate_home() -> Self {
        Self::tab(ActionKind::NavigateHome, Target::HomeTab, ids::HOME_TAB)
    }

    pub fn navigate_search() -> Self {
        Self::tab(ActionKind::NavigateSearch, Target::SearchTab, ids::SEARCH_TAB)
    }

    pub fn navigate_profile() -> Self {
        Self::tab(ActionKind::NavigateProfile, Target::ProfileTab, ids::PROFILE_TAB)
    }

    /// Search tab, focus the box, type, open the first result.
    pub fn search_user(username: &str) -> Self {
        let username = username.trim().trim_start_matches('@').to_string();
        let steps = vec![
            Step::tap(Target::SearchTab, tab_selected(ids::SEARCH_TAB)),
            Step::tap(Target::SearchInput, PostCondition::InputFocused),
            Step {
                target: None,
                primitive: Primitive::TypeText(username.clone()),
                expect: PostCondition::TextVisible(username.clone()),
                idempotent: false,
            },
            Step::tap(
                Target::SearchFirstResult,
                PostCondition::AnyOf(vec![
                    PostCondition::IdPresent(ids::PROFILE_HEADER.into()),
                    PostCondition::ScreenChanged,
                ]),
            ),
        ];
        Self {
            kind: ActionKind::SearchUser,
            parameter: Some(username),
            steps,
        }
    }

    /// Tap follow on the profile currently shown.
    pub fn follow(username: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Follow,
            parameter: Some(username.into()),
            steps: vec![Step::tap(
                Target::FollowButton,
                PostCondition::RelationshipIn(vec![
                    RelationshipState::Following,
                    RelationshipState::Requested,
                ]),
            )],
        }
    }

    pub fn view_story(username: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::ViewStory,
            parameter: Some(username.into()),
            steps: vec![Step::tap(
                Target::StoryRing,
                PostCondition::AnyOf(vec![
                    PostCondition::IdPresent(ids::REEL_VIEWER.into()),
                    PostCondition::ScreenChanged,
                ]),
            )],
        }
    }

    pub fn next_story() -> Self {
        Self {
            kind: ActionKind::NextStory,
            parameter: None,
            steps: vec![Step::tap(Target::StoryNext, PostCondition::ScreenChanged)],
        }
    }

    /// Share the story on screen to our own story.
    pub fn repost(username: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Repost,
            parameter: Some(username.into()),
            steps: vec![
                Step::tap(Target::StoryShareButton, PostCondition::ScreenChanged),
                Step::tap(Target::AddToStory, PostCondition::ScreenChanged),
                Step::tap(Target::StoryShareConfirm, PostCondition::ScreenChanged).once(),
            ],
        }
    }

    /// Open the thread from the profile on screen and send `text`.
    pub fn send_message(username: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: ActionKind::SendMessage,
            parameter: Some(username.into()),
            steps: vec![
                Step::tap(
                    Target::MessageButton,
                    PostCondition::AnyOf(vec![
                        PostCondition::IdPresent(ids::COMPOSER_INPUT.into()),
                        PostCondition::ScreenChanged,
                    ]),
                ),
                Step::tap(Target::MessageInput, PostCondition::InputFocused),
                Step {
                    target: None,
                    primitive: Primitive::TypeText(text.clone()),
                    expect: PostCondition::TextVisible(text),
                    idempotent: false,
                },
                Step::tap(Target::SendButton, PostCondition::ScreenChanged).once(),
            ],
        }
    }

    pub fn go_back() -> Self {
        Self {
            kind: ActionKind::GoBack,
            parameter: None,
            steps: vec![Step {
                target: None,
                primitive: Primitive::Back,
                expect: PostCondition::ScreenChanged,
                idempotent: false,
            }],
        }
    }

    /// Journal entry for a relationship read. Has no steps.
    pub fn check_follow_status() -> Self {
        Self {
            kind: ActionKind::CheckFollowStatus,
            parameter: None,
            steps: Vec::new(),
        }
    }

    fn tab(kind: ActionKind, target: Target, id: &str) -> Self {
        Self {
            kind,
            parameter: None,
            steps: vec![Step::tap(target, tab_selected(id))],
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    /// Username or similar. Message bodies live only in the steps and never
    /// reach the journal.
    pub fn parameter(&self) -> Option<&str> {
        self.parameter.as_deref()
    }

    /// Text the action would type, in step order.
    pub fn typed_text(&self) -> impl Iterator<Item = &str> + '_ {
        self.steps.iter().filter_map(|s| match &s.primitive {
            Primitive::TypeText(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// State the whole action must leave the UI in.
    pub fn post_condition(&self) -> Option<&PostCondition> {
        self.steps.last().map(|s| &s.expect)
    }
}

fn tab_selected(id: &str) -> PostCondition {
    PostCondition::AnyOf(vec![
        PostCondition::ElementSelected(id.into()),
        PostCondition::ScreenChanged,
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Ambiguous,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Ambiguous => "ambiguous",
            Self::Failed => "failed",
        })
    }
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    NoCandidate,
    /// The device rejected the input; nothing was delivered.
    ExecutionFailed,
    /// The input command timed out and may or may not have landed.
    DeliveryUnknown,
    Timeout,
    VerificationFailed,
    StateIndeterminate,
    Denied,
    /// Message text hit the blocked word list; nothing was sent.
    ContentBlocked,
    UnresolvableTarget,
    DeviceUnreachable,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoCandidate => "no_candidate",
            Self::ExecutionFailed => "execution_failed",
            Self::DeliveryUnknown => "delivery_unknown",
            Self::Timeout => "timeout",
            Self::VerificationFailed => "verification_failed",
            Self::StateIndeterminate => "state_indeterminate",
            Self::Denied => "denied",
            Self::ContentBlocked => "content_blocked",
            Self::UnresolvableTarget => "unresolvable_target",
            Self::DeviceUnreachable => "device_unreachable",
        })
    }
}

/// The strategy that produced the last input of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyUsed {
    pub target: Target,
    pub kind: StrategyKind,
    pub index: usize,
}

impl fmt::Display for StrategyUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.target, self.kind, self.index)
    }
}

/// Record of one call into the engine. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAttempt {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub logical_action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    pub strategy_used: Option<StrategyUsed>,
    pub outcome: Outcome,
    pub latency_ms: u64,
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Device input events issued during the attempt.
    pub primitives_issued: u32,
}

impl ActionAttempt {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn category(&self) -> Category {
        self.logical_action.category()
    }
}
