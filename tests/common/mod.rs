#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use gram_pilot::analysis::{
    AnalysisInput, ComposedMessage, FollowStatusReading, ModerationVerdict, ProfileInfo,
};
use gram_pilot::catalog::ids;
use gram_pilot::guard::{GuardConfig, PacingConfig};
use gram_pilot::{
    Analysis, AnalysisError, AnalysisRequest, Analyzer, Bounds, Engine, LocatorCatalog,
    MemoryJournal, RelationshipState, Resolution, ScriptedDevice, SessionConfig, SessionGuard,
    TaskKind, UiElement,
};

pub const FHD: Resolution = Resolution::new(1080, 2400);

pub fn quiet_guard() -> Arc<SessionGuard> {
    guard_with(GuardConfig {
        pacing: PacingConfig::none(),
        ..GuardConfig::default()
    })
}

pub fn guard_with(config: GuardConfig) -> Arc<SessionGuard> {
    Arc::new(SessionGuard::new(config))
}

pub fn engine(
    device: Arc<ScriptedDevice>,
    guard: Arc<SessionGuard>,
    journal: Arc<MemoryJournal>,
) -> Engine {
    Engine::new(
        device,
        Arc::new(LocatorCatalog::builtin().unwrap()),
        guard,
        journal,
        &SessionConfig::default(),
    )
}

fn tab(id: &str, x: i32, selected: bool) -> UiElement {
    let el = UiElement::new("android.widget.FrameLayout")
        .with_id(id)
        .with_bounds(x, 2148, x + 216, 2182)
        .clickable();
    if selected {
        el.selected()
    } else {
        el
    }
}

fn tab_bar(selected: &str) -> Vec<UiElement> {
    vec![
        tab(ids::HOME_TAB, 0, selected == ids::HOME_TAB),
        tab(ids::SEARCH_TAB, 216, selected == ids::SEARCH_TAB),
        tab(ids::PROFILE_TAB, 864, selected == ids::PROFILE_TAB),
    ]
}

fn search_box(focused: bool) -> UiElement {
    let el = UiElement::new("android.widget.EditText")
        .with_id(ids::SEARCH_INPUT)
        .with_bounds(100, 130, 980, 206);
    if focused {
        el.focused()
    } else {
        el
    }
}

pub fn profile_screen(username: &str, follow_label: &str) -> Vec<UiElement> {
    vec![
        UiElement::new("android.widget.LinearLayout")
            .with_id(ids::PROFILE_HEADER)
            .with_bounds(0, 120, 1080, 500),
        UiElement::new("android.widget.TextView")
            .with_text(username)
            .with_bounds(300, 130, 800, 180),
        UiElement::new("android.widget.ImageView")
            .with_id(ids::STORY_AVATAR)
            .with_bounds(40, 190, 240, 350)
            .clickable(),
        UiElement::new("android.widget.Button")
            .with_id(ids::FOLLOW_BUTTON)
            .with_text(follow_label)
            .with_bounds(40, 370, 520, 430)
            .clickable(),
        UiElement::new("android.widget.Button")
            .with_id(ids::MESSAGE_BUTTON)
            .with_text("Message")
            .with_bounds(540, 370, 1040, 430)
            .clickable(),
    ]
}

/// Home feed through search to `username`'s profile, plus the DM thread
/// reachable from it.
pub fn app(username: &str, follow_label: &str) -> ScriptedDevice {
    let mut search = tab_bar(ids::SEARCH_TAB);
    search.push(search_box(false));

    let mut focused = tab_bar(ids::SEARCH_TAB);
    focused.push(search_box(true));
    focused.push(
        UiElement::new("android.widget.TextView")
            .with_id(ids::SEARCH_RESULT_USERNAME)
            .with_text(username)
            .with_bounds(0, 428, 1080, 617)
            .clickable(),
    );

    let composer = |focused: bool| {
        let el = UiElement::new("android.widget.EditText")
            .with_id(ids::COMPOSER_INPUT)
            .with_bounds(40, 2200, 860, 2300);
        if focused {
            el.focused()
        } else {
            el
        }
    };
    let thread = vec![composer(false)];
    let thread_focused = vec![
        composer(true),
        UiElement::new("android.widget.ImageView")
            .with_id(ids::COMPOSER_SEND)
            .with_bounds(880, 2200, 1040, 2300)
            .clickable(),
    ];

    ScriptedDevice::new(FHD, "home", tab_bar(ids::HOME_TAB))
        .with_screen("search", search)
        .with_screen("search_focused", focused)
        .with_screen("profile", profile_screen(username, follow_label))
        .with_screen("profile_following", profile_screen(username, "Following"))
        .with_screen("thread", thread)
        .with_screen("thread_focused", thread_focused)
        .with_screen("thread_sent", vec![composer(true)])
        .with_tap("home", Bounds::new(216, 2148, 432, 2182), "search")
        .with_tap("search", Bounds::new(100, 130, 980, 206), "search_focused")
        .with_tap("search_focused", Bounds::new(0, 428, 1080, 617), "profile")
        .with_tap("profile", Bounds::new(40, 370, 520, 430), "profile_following")
        .with_tap("profile", Bounds::new(540, 370, 1040, 430), "thread")
        .with_tap("thread", Bounds::new(40, 2200, 860, 2300), "thread_focused")
        .with_tap("thread_focused", Bounds::new(880, 2200, 1040, 2300), "thread_sent")
}

/// `app` plus two stories behind the avatar. Only the first story has a
/// share flow; the second is the last one.
pub fn app_with_stories(username: &str) -> ScriptedDevice {
    let viewer = |caption: &str| {
        vec![
            UiElement::new("android.widget.FrameLayout")
                .with_id(ids::REEL_VIEWER)
                .with_bounds(0, 0, 1080, 2400),
            UiElement::new("android.widget.TextView")
                .with_text(caption)
                .with_bounds(40, 2000, 700, 2060),
            UiElement::new("android.widget.TextView")
                .with_text("Share")
                .with_bounds(800, 2200, 1000, 2300)
                .clickable(),
        ]
    };
    let sheet = vec![UiElement::new("android.widget.TextView")
        .with_text("Add post to your story")
        .with_bounds(0, 1800, 1080, 1900)
        .clickable()];
    let editor = vec![UiElement::new("android.widget.TextView")
        .with_text("Your story")
        .with_bounds(40, 2200, 400, 2300)
        .clickable()];

    app(username, "Follow")
        .with_screen("story1", viewer("first story"))
        .with_screen("story2", viewer("second story"))
        .with_screen("share_sheet", sheet)
        .with_screen("story_editor", editor)
        .with_tap("profile", Bounds::new(40, 190, 240, 350), "story1")
        .with_tap("story1", Bounds::new(800, 2200, 1000, 2300), "share_sheet")
        .with_tap("share_sheet", Bounds::new(0, 1800, 1080, 1900), "story_editor")
        .with_tap("story_editor", Bounds::new(40, 2200, 400, 2300), "story1")
        .with_tap("story1", Bounds::new(540, 200, 1080, 1900), "story2")
        .with_back("story1", "profile")
        .with_back("story2", "profile")
}

/// Canned analysis answers. Screenshots from `ScriptedDevice` carry the
/// screen name, which decides moderation verdicts.
#[derive(Default)]
pub struct CannedAnalyzer {
    pub unsafe_screens: Vec<String>,
    pub fail_composition: bool,
    /// Composed DM text; a friendly default when unset.
    pub message: Option<String>,
    pub image_status: Option<RelationshipState>,
    pub requests: Mutex<Vec<AnalysisRequest>>,
}

impl CannedAnalyzer {
    pub fn tasks(&self) -> Vec<TaskKind> {
        self.requests.lock().unwrap().iter().map(|r| r.task).collect()
    }
}

#[async_trait]
impl Analyzer for CannedAnalyzer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis, AnalysisError> {
        self.requests.lock().unwrap().push(request.clone());
        match request.task {
            TaskKind::ProfileOcr => Ok(Analysis::Profile(ProfileInfo {
                username: "jane.doe".into(),
                fullname: "Jane Doe".into(),
                bio: "Ceramics and coffee".into(),
                follower_count: "1.2K".into(),
                ..Default::default()
            })),
            TaskKind::ContentModeration => {
                let screen = match &request.input {
                    AnalysisInput::Image(png) => String::from_utf8_lossy(&png[8..]).to_string(),
                    AnalysisInput::Text(_) => String::new(),
                };
                let flagged = self.unsafe_screens.contains(&screen);
                Ok(Analysis::Moderation(ModerationVerdict {
                    is_appropriate: !flagged,
                    contains_violence: flagged,
                    contains_nudity: false,
                    contains_hate_speech: false,
                    reason: String::new(),
                }))
            }
            TaskKind::MessageComposition if self.fail_composition => Err(AnalysisError::Api {
                status: 400,
                message: "bad request".into(),
            }),
            TaskKind::MessageComposition => Ok(Analysis::Message(ComposedMessage {
                text: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "Loved your ceramics, want to collab?".into()),
            })),
            TaskKind::FollowStatusFromImage => Ok(Analysis::FollowStatus(FollowStatusReading {
                status: self.image_status.unwrap_or(RelationshipState::Unknown),
            })),
            TaskKind::LocateElement => Err(AnalysisError::InvalidRequest("not scripted".into())),
        }
    }
}
