use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::ids;
use crate::snapshot::DeviceSnapshot;

/// Our relationship to the profile on screen, read fresh on every view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipState {
    Unknown,
    NotFollowing,
    Following,
    Requested,
}

impl RelationshipState {
    /// Whether tapping the follow button is allowed. Only `NotFollowing`
    /// qualifies: a tap in any other state could unfollow or cancel.
    pub fn permits_follow_tap(&self) -> bool {
        matches!(self, Self::NotFollowing)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Following | Self::Requested)
    }
}

impl fmt::Display for RelationshipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::NotFollowing => "not_following",
            Self::Following => "following",
            Self::Requested => "requested",
        })
    }
}

/// Header button label → state. Labels are compared trimmed and lowercased.
const LABELS: &[(&str, RelationshipState)] = &[
    ("follow", RelationshipState::NotFollowing),
    ("follow back", RelationshipState::NotFollowing),
    ("팔로우", RelationshipState::NotFollowing),
    ("맞팔로우", RelationshipState::NotFollowing),
    ("following", RelationshipState::Following),
    ("팔로잉", RelationshipState::Following),
    ("requested", RelationshipState::Requested),
    ("요청됨", RelationshipState::Requested),
];

/// Derives [`RelationshipState`] from a profile snapshot.
pub struct FollowStateMachine;

impl FollowStateMachine {
    pub fn classify_label(label: &str) -> RelationshipState {
        let label = label.trim().to_lowercase();
        LABELS
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, s)| *s)
            .unwrap_or(RelationshipState::Unknown)
    }

    /// The header follow button decides when it is present. Otherwise every
    /// button-like label is read; disagreeing labels give `Unknown`.
    pub fn derive(snapshot: &DeviceSnapshot) -> RelationshipState {
        if let Some(button) = snapshot.find_by_id(ids::FOLLOW_BUTTON) {
            let state = Self::classify_label(button.label());
            tracing::debug!(label = button.label(), %state, "Follow button read");
            return state;
        }

        let mut found = RelationshipState::Unknown;
        for element in snapshot.elements.iter().filter(|e| e.looks_like_button()) {
            let state = Self::classify_label(element.label());
            if state == RelationshipState::Unknown {
                continue;
            }
            if found != RelationshipState::Unknown && found != state {
                tracing::debug!(first = %found, second = %state, "Conflicting relationship labels");
                return RelationshipState::Unknown;
            }
            found = state;
        }
        tracing::debug!(state = %found, "Relationship derived from labels");
        found
    }
}
