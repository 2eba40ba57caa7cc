//! Multi-action jobs built on [`Engine`] and an [`Analyzer`].
//!
//! Engine errors (unreachable device, unresolvable target, halted session)
//! end a workflow with `Err`. Analysis failures and failed attempts are
//! written into the report instead; they never touch engine state.

use serde::Serialize;
use std::time::Duration;

use crate::action::{ActionAttempt, LogicalAction};
use crate::analysis::{
    analyze_with_retry, Analysis, AnalysisRequest, Analyzer, ModerationVerdict, ProfileInfo,
    TaskKind,
};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::follow::RelationshipState;

const AI_ATTEMPTS: u32 = 3;
const AI_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowReport {
    pub username: String,
    pub state_before: RelationshipState,
    pub followed: bool,
    pub already_connected: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DmReport {
    pub username: String,
    pub profile: Option<ProfileInfo>,
    pub message_generated: bool,
    pub message_sent: bool,
    pub message_text: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileReport {
    pub username: String,
    pub profile: Option<ProfileInfo>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryVerdict {
    pub index: u32,
    pub verdict: Option<ModerationVerdict>,
    pub reposted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoryReport {
    pub username: String,
    pub stories_seen: u32,
    pub reposted: u32,
    pub skipped: u32,
    pub stories: Vec<StoryVerdict>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Hierarchy,
    Screenshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: RelationshipState,
    pub source: StatusSource,
    pub error: Option<String>,
}

/// `Err` with the attempt's detail unless it succeeded.
fn succeeded(attempt: &ActionAttempt) -> Result<(), String> {
    if attempt.is_success() {
        return Ok(());
    }
    let failure = attempt.failure.map(|f| f.to_string()).unwrap_or_default();
    Err(match &attempt.error_detail {
        Some(detail) => format!("{} {failure}: {detail}", attempt.logical_action),
        None => format!("{} {failure}", attempt.logical_action),
    })
}

/// Search the user, read the relationship, follow only if not connected.
pub async fn follow_user(engine: &Engine, username: &str) -> Result<FollowReport, EngineError> {
    let mut report = FollowReport {
        username: username.to_string(),
        state_before: RelationshipState::Unknown,
        followed: false,
        already_connected: false,
        error: None,
    };

    let search = engine.perform(&LogicalAction::search_user(username)).await?;
    if let Err(e) = succeeded(&search) {
        report.error = Some(e);
        return Ok(report);
    }

    report.state_before = engine.check_follow_status().await?;
    report.already_connected = report.state_before.is_settled();

    let follow = engine.perform(&LogicalAction::follow(username)).await?;
    match succeeded(&follow) {
        Ok(()) => report.followed = follow.primitives_issued > 0,
        Err(e) => report.error = Some(e),
    }
    tracing::info!(user = username, followed = report.followed, already = report.already_connected, "Follow workflow finished");
    Ok(report)
}

/// Screenshot the profile on screen and read it.
async fn read_profile(engine: &Engine, analyzer: &dyn Analyzer) -> Result<Result<ProfileInfo, String>, EngineError> {
    let png = engine.capture_screenshot().await?;
    let request = AnalysisRequest::image(TaskKind::ProfileOcr, png);
    Ok(match analyze_with_retry(analyzer, request, AI_ATTEMPTS, AI_BACKOFF).await {
        Ok(Analysis::Profile(info)) => Ok(info),
        Ok(other) => Err(format!("unexpected analysis {other:?}")),
        Err(e) => Err(e.to_string()),
    })
}

/// Open a profile and extract its header through OCR.
pub async fn scrape_profile(
    engine: &Engine,
    analyzer: &dyn Analyzer,
    username: &str,
) -> Result<ProfileReport, EngineError> {
    let mut report = ProfileReport {
        username: username.to_string(),
        profile: None,
        error: None,
    };

    let search = engine.perform(&LogicalAction::search_user(username)).await?;
    if let Err(e) = succeeded(&search) {
        report.error = Some(e);
        return Ok(report);
    }

    match read_profile(engine, analyzer).await? {
        Ok(info) => report.profile = Some(info),
        Err(e) => {
            tracing::warn!(user = username, error = %e, "Profile OCR failed");
            report.error = Some(e);
        }
    }
    Ok(report)
}

/// Open the profile, compose a message for it, and send it.
pub async fn send_personalized_dm(
    engine: &Engine,
    analyzer: &dyn Analyzer,
    username: &str,
    campaign: &str,
    use_profile_info: bool,
) -> Result<DmReport, EngineError> {
    let mut report = DmReport {
        username: username.to_string(),
        profile: None,
        message_generated: false,
        message_sent: false,
        message_text: None,
        error: None,
    };

    let search = engine.perform(&LogicalAction::search_user(username)).await?;
    if let Err(e) = succeeded(&search) {
        report.error = Some(e);
        return Ok(report);
    }

    if use_profile_info {
        match read_profile(engine, analyzer).await? {
            Ok(info) => report.profile = Some(info),
            Err(e) => tracing::warn!(user = username, error = %e, "Sending without profile details"),
        }
    }

    let mut brief = format!("Target user: @{username}\n\nCampaign context:\n{campaign}");
    if let Some(profile) = &report.profile {
        brief.push_str("\n\nProfile information:\n");
        brief.push_str(&profile.summary());
    }
    let request = AnalysisRequest::text(TaskKind::MessageComposition, brief);
    let text = match analyze_with_retry(analyzer, request, AI_ATTEMPTS, AI_BACKOFF).await {
        Ok(Analysis::Message(msg)) => msg.text,
        Ok(other) => {
            report.error = Some(format!("unexpected analysis {other:?}"));
            return Ok(report);
        }
        Err(e) => {
            report.error = Some(format!("message composition failed: {e}"));
            return Ok(report);
        }
    };
    report.message_generated = true;
    report.message_text = Some(text.clone());

    let send = engine.perform(&LogicalAction::send_message(username, text)).await?;
    match succeeded(&send) {
        Ok(()) => report.message_sent = true,
        Err(e) => report.error = Some(e),
    }
    tracing::info!(user = username, sent = report.message_sent, "DM workflow finished");
    Ok(report)
}

/// Watch up to `max_stories` of a user's stories, reposting the ones the
/// moderation check passes. Stories that cannot be checked are skipped.
pub async fn restory_from_user(
    engine: &Engine,
    analyzer: &dyn Analyzer,
    username: &str,
    max_stories: u32,
) -> Result<RestoryReport, EngineError> {
    let mut report = RestoryReport {
        username: username.to_string(),
        stories_seen: 0,
        reposted: 0,
        skipped: 0,
        stories: Vec::new(),
        error: None,
    };

    let search = engine.perform(&LogicalAction::search_user(username)).await?;
    if let Err(e) = succeeded(&search) {
        report.error = Some(e);
        return Ok(report);
    }

    let open = engine.perform(&LogicalAction::view_story(username)).await?;
    if let Err(e) = succeeded(&open) {
        report.error = Some(format!("no story to open: {e}"));
        return Ok(report);
    }

    for index in 0..max_stories {
        report.stories_seen += 1;
        let mut story = StoryVerdict {
            index,
            verdict: None,
            reposted: false,
            error: None,
        };

        let png = engine.capture_screenshot().await?;
        let request = AnalysisRequest::image(TaskKind::ContentModeration, png);
        match analyze_with_retry(analyzer, request, AI_ATTEMPTS, AI_BACKOFF).await {
            Ok(Analysis::Moderation(verdict)) => story.verdict = Some(verdict),
            Ok(other) => story.error = Some(format!("unexpected analysis {other:?}")),
            Err(e) => story.error = Some(e.to_string()),
        }

        if story.verdict.as_ref().is_some_and(ModerationVerdict::is_safe) {
            let repost = engine.perform(&LogicalAction::repost(username)).await?;
            match succeeded(&repost) {
                Ok(()) => story.reposted = true,
                Err(e) => story.error = Some(e),
            }
        }

        if story.reposted {
            report.reposted += 1;
        } else {
            report.skipped += 1;
        }
        tracing::info!(user = username, index, reposted = story.reposted, "Story handled");
        report.stories.push(story);

        if index + 1 < max_stories {
            let next = engine.perform(&LogicalAction::next_story()).await?;
            if succeeded(&next).is_err() {
                tracing::info!(user = username, seen = report.stories_seen, "No further stories");
                break;
            }
        }
    }

    let back = engine.perform(&LogicalAction::go_back()).await?;
    if let Err(e) = succeeded(&back) {
        tracing::warn!(error = %e, "Could not leave the story viewer");
    }
    Ok(report)
}

/// Relationship from the hierarchy, falling back to reading a screenshot
/// when the hierarchy is inconclusive.
pub async fn follow_status_from_image(
    engine: &Engine,
    analyzer: &dyn Analyzer,
) -> Result<StatusReport, EngineError> {
    let state = engine.check_follow_status().await?;
    if state != RelationshipState::Unknown {
        return Ok(StatusReport {
            state,
            source: StatusSource::Hierarchy,
            error: None,
        });
    }

    let png = engine.capture_screenshot().await?;
    let request = AnalysisRequest::image(TaskKind::FollowStatusFromImage, png);
    let (state, error) = match analyze_with_retry(analyzer, request, AI_ATTEMPTS, AI_BACKOFF).await {
        Ok(Analysis::FollowStatus(reading)) => (reading.status, None),
        Ok(other) => (RelationshipState::Unknown, Some(format!("unexpected analysis {other:?}"))),
        Err(e) => (RelationshipState::Unknown, Some(e.to_string())),
    };
    Ok(StatusReport {
        state,
        source: StatusSource::Screenshot,
        error,
    })
}
