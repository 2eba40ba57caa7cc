//! Logical UI targets and the ordered ways of finding them on screen.
//!
//! The catalog is data, not code: it can be loaded from a JSON file so a
//! new app build or screen size is a recalibration, not a release. Entries
//! are kept in priority order (semantic id, then visible text, then
//! resolution-guarded coordinate, then the vision fallback), with ties
//! broken by the order they were listed in.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::error::EngineError;
use crate::snapshot::Resolution;

/// Resource ids the app is known to use.
pub mod ids {
    pub const HOME_TAB: &str = "com.instagram.android:id/feed_tab";
    pub const SEARCH_TAB: &str = "com.instagram.android:id/search_tab";
    pub const REELS_TAB: &str = "com.instagram.android:id/clips_tab";
    pub const PROFILE_TAB: &str = "com.instagram.android:id/profile_tab";
    pub const SEARCH_INPUT: &str = "com.instagram.android:id/action_bar_search_edit_text";
    pub const SEARCH_RESULT_USERNAME: &str = "com.instagram.android:id/row_search_user_username";
    pub const SEARCH_RESULT_CONTAINER: &str =
        "com.instagram.android:id/row_search_user_info_container";
    pub const SEARCH_RESULT_PRIMARY: &str = "com.instagram.android:id/row_user_primary_text";
    pub const PROFILE_HEADER: &str = "com.instagram.android:id/profile_header_container";
    pub const FOLLOW_BUTTON: &str = "com.instagram.android:id/profile_header_follow_button";
    pub const MESSAGE_BUTTON: &str = "com.instagram.android:id/row_profile_header_button_message";
    pub const STORY_AVATAR: &str = "com.instagram.android:id/row_profile_header_imageview";
    pub const REEL_VIEWER: &str = "com.instagram.android:id/reel_viewer_root";
    pub const COMPOSER_INPUT: &str = "com.instagram.android:id/row_thread_composer_edittext";
    pub const COMPOSER_SEND: &str = "com.instagram.android:id/row_thread_composer_send_button";
}

/// Screen size the built-in coordinates were measured on.
pub const BASE_RESOLUTION: Resolution = Resolution::new(1080, 2400);

/// A logical element of the app's UI, independent of how it is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    HomeTab,
    SearchTab,
    ReelsTab,
    ProfileTab,
    SearchInput,
    SearchFirstResult,
    FollowButton,
    MessageButton,
    MessageInput,
    SendButton,
    StoryRing,
    StoryShareButton,
    AddToStory,
    StoryShareConfirm,
    StoryNext,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HomeTab => "home_tab",
            Self::SearchTab => "search_tab",
            Self::ReelsTab => "reels_tab",
            Self::ProfileTab => "profile_tab",
            Self::SearchInput => "search_input",
            Self::SearchFirstResult => "search_first_result",
            Self::FollowButton => "follow_button",
            Self::MessageButton => "message_button",
            Self::MessageInput => "message_input",
            Self::SendButton => "send_button",
            Self::StoryRing => "story_ring",
            Self::StoryShareButton => "story_share_button",
            Self::AddToStory => "add_to_story",
            Self::StoryShareConfirm => "story_share_confirm",
            Self::StoryNext => "story_next",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of locating a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocatorStrategy {
    /// Resource id, full or short (`search_tab`).
    SemanticId { id: String },
    /// Case-insensitive regex over visible text and accessibility labels.
    TextPattern { pattern: String },
    /// Fraction of the screen, valid only on the guarded resolution.
    NormalizedCoordinate {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guard: Option<Resolution>,
    },
    /// Ask the analysis service to find the element on a screenshot.
    Vision { description: String },
}

impl LocatorStrategy {
    pub fn semantic_id(id: impl Into<String>) -> Self {
        Self::SemanticId { id: id.into() }
    }

    pub fn text(pattern: impl Into<String>) -> Self {
        Self::TextPattern {
            pattern: pattern.into(),
        }
    }

    pub fn coordinate(x: f64, y: f64, guard: Resolution) -> Self {
        Self::NormalizedCoordinate {
            x,
            y,
            guard: Some(guard),
        }
    }

    /// Coordinate measured in pixels on [`BASE_RESOLUTION`].
    pub fn base_pixel(x: u32, y: u32) -> Self {
        Self::coordinate(
            f64::from(x) / f64::from(BASE_RESOLUTION.width),
            f64::from(y) / f64::from(BASE_RESOLUTION.height),
            BASE_RESOLUTION,
        )
    }

    pub fn vision(description: impl Into<String>) -> Self {
        Self::Vision {
            description: description.into(),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::SemanticId { .. } => StrategyKind::SemanticId,
            Self::TextPattern { .. } => StrategyKind::TextPattern,
            Self::NormalizedCoordinate { .. } => StrategyKind::NormalizedCoordinate,
            Self::Vision { .. } => StrategyKind::Vision,
        }
    }
}

/// Strategy kinds in decreasing order of reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SemanticId,
    TextPattern,
    NormalizedCoordinate,
    Vision,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SemanticId => "semantic_id",
            Self::TextPattern => "text_pattern",
            Self::NormalizedCoordinate => "normalized_coordinate",
            Self::Vision => "vision",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{target}: coordinate strategy #{index} has no resolution guard")]
    UnguardedCoordinate { target: Target, index: usize },

    #[error("{target}: coordinate strategy #{index} is outside the 0..1 range")]
    CoordinateOutOfRange { target: Target, index: usize },

    #[error("{target}: invalid text pattern {pattern:?}: {source}")]
    BadPattern {
        target: Target,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A validated strategy, with its text pattern compiled once.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    strategy: LocatorStrategy,
    matcher: Option<Regex>,
}

impl CatalogEntry {
    pub fn strategy(&self) -> &LocatorStrategy {
        &self.strategy
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn matcher(&self) -> Option<&Regex> {
        self.matcher.as_ref()
    }
}

/// On-disk shape of a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub version: String,
    pub targets: BTreeMap<Target, Vec<LocatorStrategy>>,
}

/// Read-only table of target → strategies, fixed for one catalog version.
#[derive(Debug, Clone)]
pub struct LocatorCatalog {
    version: String,
    entries: BTreeMap<Target, Vec<CatalogEntry>>,
}

impl LocatorCatalog {
    pub fn from_file(file: CatalogFile) -> Result<Self, CatalogError> {
        let mut entries = BTreeMap::new();
        for (target, strategies) in file.targets {
            entries.insert(target, validate(target, strategies)?);
        }
        Ok(Self {
            version: file.version,
            entries,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Self::from_file(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            version = %catalog.version,
            targets = catalog.entries.len(),
            "Loaded locator catalog"
        );
        Ok(catalog)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Strategies for `target` in priority order.
    pub fn strategies_for(&self, target: Target) -> Result<&[CatalogEntry], EngineError> {
        match self.entries.get(&target) {
            Some(list) if !list.is_empty() => Ok(list),
            _ => Err(EngineError::UnresolvableTarget(target)),
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = Target> + '_ {
        self.entries.keys().copied()
    }

    pub fn to_file(&self) -> CatalogFile {
        CatalogFile {
            version: self.version.clone(),
            targets: self
                .entries
                .iter()
                .map(|(t, list)| (*t, list.iter().map(|e| e.strategy.clone()).collect()))
                .collect(),
        }
    }

    /// Catalog calibrated on a 1080x2400 device running a recent app build.
    pub fn builtin() -> Result<Self, CatalogError> {
        use LocatorStrategy as S;

        let mut targets = BTreeMap::new();
        targets.insert(
            Target::HomeTab,
            vec![S::semantic_id(ids::HOME_TAB), S::text("^home$"), S::base_pixel(108, 2165)],
        );
        targets.insert(
            Target::SearchTab,
            vec![
                S::semantic_id(ids::SEARCH_TAB),
                S::text("^search( and explore)?$|^검색"),
                S::base_pixel(324, 2165),
            ],
        );
        targets.insert(
            Target::ReelsTab,
            vec![S::semantic_id(ids::REELS_TAB), S::text("^reels$"), S::base_pixel(540, 2165)],
        );
        targets.insert(
            Target::ProfileTab,
            vec![
                S::semantic_id(ids::PROFILE_TAB),
                S::text("^profile$|^프로필$"),
                S::base_pixel(972, 2165),
            ],
        );
        targets.insert(
            Target::SearchInput,
            vec![S::semantic_id(ids::SEARCH_INPUT), S::base_pixel(530, 168)],
        );
        targets.insert(
            Target::SearchFirstResult,
            vec![
                S::semantic_id(ids::SEARCH_RESULT_USERNAME),
                S::semantic_id(ids::SEARCH_RESULT_CONTAINER),
                S::semantic_id("com.instagram.android:id/username_text_view"),
                S::semantic_id(ids::SEARCH_RESULT_PRIMARY),
                S::base_pixel(540, 522),
            ],
        );
        targets.insert(
            Target::FollowButton,
            vec![
                S::semantic_id(ids::FOLLOW_BUTTON),
                S::text("^follow( back)?$|^팔로우$|^맞팔로우$"),
                S::base_pixel(168, 397),
                S::vision("the blue Follow button in the profile header"),
            ],
        );
        targets.insert(
            Target::MessageButton,
            vec![
                S::semantic_id(ids::MESSAGE_BUTTON),
                S::text("^message$|^메시지 보내기$"),
                S::base_pixel(372, 290),
            ],
        );
        targets.insert(
            Target::MessageInput,
            vec![
                S::semantic_id(ids::COMPOSER_INPUT),
                S::text("^message\\.\\.\\.$|^메시지"),
                S::base_pixel(400, 2200),
            ],
        );
        targets.insert(
            Target::SendButton,
            vec![
                S::semantic_id(ids::COMPOSER_SEND),
                S::text("^send$|^보내기$"),
                S::base_pixel(668, 1420),
            ],
        );
        targets.insert(
            Target::StoryRing,
            vec![
                S::semantic_id(ids::STORY_AVATAR),
                S::text("story"),
                S::vision("the profile picture with a coloured story ring"),
            ],
        );
        targets.insert(
            Target::StoryShareButton,
            vec![S::text("^(send|share)( story)?$|^공유$|^보내기$")],
        );
        targets.insert(
            Target::AddToStory,
            vec![S::text("add.*story|스토리.*추가")],
        );
        targets.insert(
            Target::StoryShareConfirm,
            vec![S::text("^(your story|share|post|send)$|^내 스토리$")],
        );
        targets.insert(
            Target::StoryNext,
            vec![
                S::coordinate(0.9, 0.5, BASE_RESOLUTION),
                S::coordinate(0.9, 0.5, Resolution::new(1080, 2340)),
                S::coordinate(0.9, 0.5, Resolution::new(1440, 3200)),
                S::coordinate(0.9, 0.5, Resolution::new(720, 1600)),
            ],
        );

        let file = CatalogFile {
            version: "builtin-1080x2400".to_string(),
            targets,
        };
        Self::from_file(file)
    }
}

fn validate(target: Target, strategies: Vec<LocatorStrategy>) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut entries = Vec::with_capacity(strategies.len());
    for (index, strategy) in strategies.into_iter().enumerate() {
        let matcher = match &strategy {
            LocatorStrategy::TextPattern { pattern } => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| CatalogError::BadPattern {
                        target,
                        pattern: pattern.clone(),
                        source,
                    })?,
            ),
            LocatorStrategy::NormalizedCoordinate { x, y, guard } => {
                if guard.is_none() {
                    return Err(CatalogError::UnguardedCoordinate { target, index });
                }
                if !(0.0..=1.0).contains(x) || !(0.0..=1.0).contains(y) {
                    return Err(CatalogError::CoordinateOutOfRange { target, index });
                }
                None
            }
            LocatorStrategy::SemanticId { .. } | LocatorStrategy::Vision { .. } => None,
        };
        entries.push(CatalogEntry { strategy, matcher });
    }
    // Stable: within a kind, listing order is preserved.
    entries.sort_by_key(CatalogEntry::kind);
    Ok(entries)
}
