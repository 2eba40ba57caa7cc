//! Post-conditions and the before/after comparison that classifies an attempt.

use serde::{Deserialize, Serialize};

use crate::action::Outcome;
use crate::device::DeviceError;
use crate::follow::{FollowStateMachine, RelationshipState};
use crate::probe::DeviceProbe;
use crate::snapshot::DeviceSnapshot;

/// Observable UI state expected after a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expect", content = "value", rename_all = "snake_case")]
pub enum PostCondition {
    /// The screen differs from the one before the input.
    ScreenChanged,
    /// Element with this resource id is selected (e.g. a bottom tab).
    ElementSelected(String),
    /// An editable field has input focus.
    InputFocused,
    /// Some element's text contains this string, case-insensitively.
    TextVisible(String),
    IdPresent(String),
    RelationshipIn(Vec<RelationshipState>),
    /// Holds when any of the inner conditions holds.
    AnyOf(Vec<PostCondition>),
}

impl PostCondition {
    /// `None` when the snapshots do not contain what is needed to decide.
    pub fn evaluate(&self, before: &DeviceSnapshot, after: &DeviceSnapshot) -> Option<bool> {
        match self {
            Self::ScreenChanged => Some(!after.same_screen(before)),
            Self::ElementSelected(id) => match after.find_by_id(id) {
                Some(e) => Some(e.selected),
                None if before.has_id(id) => Some(false),
                None => None,
            },
            Self::InputFocused => {
                if after.focused_editable().is_some() {
                    Some(true)
                } else if after.has_editable() || before.has_editable() {
                    Some(false)
                } else {
                    None
                }
            }
            Self::TextVisible(needle) => {
                if after.elements.is_empty() {
                    return None;
                }
                let needle = needle.to_lowercase();
                Some(after.elements.iter().any(|e| {
                    e.text.to_lowercase().contains(&needle)
                        || e.content_desc.to_lowercase().contains(&needle)
                }))
            }
            Self::IdPresent(id) => {
                if after.has_id(id) {
                    Some(true)
                } else if before.has_id(id) {
                    Some(false)
                } else {
                    None
                }
            }
            Self::RelationshipIn(states) => match FollowStateMachine::derive(after) {
                RelationshipState::Unknown => None,
                state => Some(states.contains(&state)),
            },
            Self::AnyOf(conditions) => {
                let mut undecided = false;
                for c in conditions {
                    match c.evaluate(before, after) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => undecided = true,
                    }
                }
                if undecided { None } else { Some(false) }
            }
        }
    }
}

/// Classifies an attempt by comparing snapshots against a post-condition.
pub struct OutcomeVerifier;

impl OutcomeVerifier {
    /// A failed condition on an unchanged screen is `Ambiguous`: the input
    /// may not have landed yet.
    pub fn verify(
        condition: &PostCondition,
        before: &DeviceSnapshot,
        after: &DeviceSnapshot,
    ) -> Outcome {
        match condition.evaluate(before, after) {
            Some(true) => Outcome::Success,
            None => Outcome::Ambiguous,
            Some(false) if after.same_screen(before) => Outcome::Ambiguous,
            Some(false) => Outcome::Failed,
        }
    }

    /// [`verify`](Self::verify), then one re-probe if the answer was
    /// `Ambiguous`. Never returns `Ambiguous`. The returned snapshot is the
    /// latest one seen.
    pub async fn verify_settled(
        condition: &PostCondition,
        before: &DeviceSnapshot,
        after: DeviceSnapshot,
        probe: &DeviceProbe,
    ) -> Result<(Outcome, DeviceSnapshot), DeviceError> {
        let outcome = Self::verify(condition, before, &after);
        if outcome != Outcome::Ambiguous {
            return Ok((outcome, after));
        }

        tracing::debug!(?condition, "Ambiguous outcome, re-checking");
        let recheck = probe.snapshot().await?;
        let outcome = match Self::verify(condition, before, &recheck) {
            Outcome::Success => Outcome::Success,
            _ => Outcome::Failed,
        };
        Ok((outcome, recheck))
    }
}
