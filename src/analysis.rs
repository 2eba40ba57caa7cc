//! Image and text understanding through an OpenAI-compatible chat API.
//!
//! Analysis never holds the device: it works on screenshots that were
//! already captured, and its failures are reported to the calling workflow
//! without touching engine or budget state.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::follow::RelationshipState;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Longest direct message the composer is asked for.
pub const MESSAGE_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ProfileOcr,
    ContentModeration,
    FollowStatusFromImage,
    MessageComposition,
    /// Find a described element on a screenshot.
    LocateElement,
}

impl TaskKind {
    pub fn takes_image(&self) -> bool {
        !matches!(self, Self::MessageComposition)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProfileOcr => "profile_ocr",
            Self::ContentModeration => "content_moderation",
            Self::FollowStatusFromImage => "follow_status_from_image",
            Self::MessageComposition => "message_composition",
            Self::LocateElement => "locate_element",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisInput {
    /// PNG bytes.
    Image(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub task: TaskKind,
    pub input: AnalysisInput,
    /// Extra instructions: element description, campaign brief, profile facts.
    pub context: Option<String>,
}

impl AnalysisRequest {
    pub fn image(task: TaskKind, png: Vec<u8>) -> Self {
        Self {
            task,
            input: AnalysisInput::Image(png),
            context: None,
        }
    }

    pub fn text(task: TaskKind, text: impl Into<String>) -> Self {
        Self {
            task,
            input: AnalysisInput::Text(text.into()),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileInfo {
    pub username: String,
    pub fullname: String,
    pub bio: String,
    pub post_count: Option<u64>,
    /// As displayed, e.g. "1.2K".
    pub follower_count: String,
    pub following_count: String,
    pub is_verified: bool,
    pub is_private: bool,
    pub is_business: bool,
}

impl ProfileInfo {
    /// Short fact sheet handed to message composition.
    pub fn summary(&self) -> String {
        let or_na = |s: &str| if s.trim().is_empty() { "N/A".to_string() } else { s.trim().to_string() };
        format!(
            "Name: {}\nBio: {}\nVerified: {}\nFollowers: {}",
            or_na(&self.fullname),
            or_na(&self.bio),
            self.is_verified,
            or_na(&self.follower_count)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub is_appropriate: bool,
    #[serde(default)]
    pub contains_violence: bool,
    #[serde(default)]
    pub contains_nudity: bool,
    #[serde(default)]
    pub contains_hate_speech: bool,
    #[serde(default)]
    pub reason: String,
}

impl ModerationVerdict {
    /// Appropriate and free of every flagged category.
    pub fn is_safe(&self) -> bool {
        self.is_appropriate
            && !self.contains_violence
            && !self.contains_nudity
            && !self.contains_hate_speech
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowStatusReading {
    pub status: RelationshipState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub text: String,
}

/// Element position as fractions of the screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementLocation {
    pub found: bool,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Analysis {
    Profile(ProfileInfo),
    Moderation(ModerationVerdict),
    FollowStatus(FollowStatusReading),
    Message(ComposedMessage),
    Location(ElementLocation),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("analysis API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response does not match the {task} schema: {detail}")]
    Schema { task: TaskKind, detail: String },

    #[error("{0} is not set")]
    MissingApiKey(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis, AnalysisError>;
}

/// Retry retryable failures with doubling back-off; other errors return at once.
pub async fn analyze_with_retry(
    analyzer: &dyn Analyzer,
    request: AnalysisRequest,
    attempts: u32,
    base_delay: Duration,
) -> Result<Analysis, AnalysisError> {
    let attempts = attempts.max(1);
    let mut delay = base_delay;
    let mut tries = 0;
    loop {
        tries += 1;
        match analyzer.analyze(request.clone()).await {
            Ok(analysis) => return Ok(analysis),
            Err(e) if e.is_retryable() && tries < attempts => {
                tracing::warn!(task = %request.task, error = %e, retry_in_ms = delay.as_millis() as u64, "Analysis failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

const SYSTEM_PROMPT: &str = "You read screenshots of a social media mobile app and answer with exactly what is asked. When JSON is requested, reply with a single JSON object and nothing else.";

fn task_prompt(task: TaskKind) -> &'static str {
    match task {
        TaskKind::ProfileOcr => r#"Read this profile screen. Reply with JSON:
{"username": string without @, "fullname": string, "bio": string, "post_count": integer or null, "follower_count": string as shown, "following_count": string as shown, "is_verified": bool, "is_private": bool, "is_business": bool}"#,
        TaskKind::ContentModeration => r#"Decide whether this story is safe to share publicly. Reply with JSON:
{"is_appropriate": bool, "contains_violence": bool, "contains_nudity": bool, "contains_hate_speech": bool, "reason": short string}"#,
        TaskKind::FollowStatusFromImage => r#"Read the follow button in this profile header. Reply with JSON:
{"status": "not_following" | "following" | "requested" | "unknown"}"#,
        TaskKind::MessageComposition => "Write one friendly, natural direct message for the user described below. Personalise it from the profile facts when given, keep it under 200 characters, use at most one emoji, end with a clear call to action. Reply with the message text only, no quotes.",
        TaskKind::LocateElement => r#"Find the element described below on this screenshot. Reply with JSON:
{"found": bool, "x": horizontal centre as a fraction 0..1 of the width, "y": vertical centre as a fraction 0..1 of the height}"#,
    }
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiAnalyzer {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiAnalyzer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Key from `OPENAI_API_KEY`.
    pub fn from_env(model: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, AnalysisError> {
        let key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(AnalysisError::MissingApiKey(API_KEY_ENV))?;
        Ok(Self::new(key, model, endpoint))
    }

    fn build_body(&self, request: &AnalysisRequest) -> Result<Value, AnalysisError> {
        let mut prompt = task_prompt(request.task).to_string();
        if let Some(context) = &request.context {
            prompt.push_str("\n\n");
            prompt.push_str(context);
        }

        let user_content = match (&request.input, request.task.takes_image()) {
            (AnalysisInput::Image(png), true) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(png);
                json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{encoded}")}}
                ])
            }
            (AnalysisInput::Text(text), false) => json!(format!("{prompt}\n\n{text}")),
            (_, true) => {
                return Err(AnalysisError::InvalidRequest(format!("{} needs an image", request.task)));
            }
            (_, false) => {
                return Err(AnalysisError::InvalidRequest(format!("{} needs text", request.task)));
            }
        };

        let temperature = if request.task == TaskKind::MessageComposition { 0.7 } else { 0.0 };
        Ok(json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_content},
            ],
            "max_tokens": 500,
            "temperature": temperature,
        }))
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis, AnalysisError> {
        let body = self.build_body(&request)?;
        tracing::debug!(task = %request.task, model = %self.model, "Sending analysis request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            let err = api_error(status.as_u16(), &raw);
            tracing::warn!(task = %request.task, status = status.as_u16(), error = %err, "Analysis API error");
            return Err(err);
        }

        let payload: Value = serde_json::from_str(&raw).map_err(|e| AnalysisError::Schema {
            task: request.task,
            detail: format!("completion is not JSON: {e}"),
        })?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AnalysisError::Schema {
                task: request.task,
                detail: "no message content in completion".into(),
            })?;

        parse_response(request.task, content)
    }
}

/// Error for a non-success HTTP status. The body may be a JSON error
/// object or a proxy's HTML page.
fn api_error(status: u16, body: &str) -> AnalysisError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "empty response body".to_string()
            } else {
                trimmed.chars().take(200).collect()
            }
        });
    if status == 429 {
        AnalysisError::RateLimited(message)
    } else {
        AnalysisError::Api { status, message }
    }
}

/// Turn model output into the typed answer for `task`.
pub fn parse_response(task: TaskKind, content: &str) -> Result<Analysis, AnalysisError> {
    let cleaned = strip_fences(content);
    let schema = |e: serde_json::Error| AnalysisError::Schema {
        task,
        detail: e.to_string(),
    };

    let analysis = match task {
        TaskKind::ProfileOcr => Analysis::Profile(serde_json::from_str(cleaned).map_err(schema)?),
        TaskKind::ContentModeration => {
            Analysis::Moderation(serde_json::from_str(cleaned).map_err(schema)?)
        }
        TaskKind::FollowStatusFromImage => {
            Analysis::FollowStatus(serde_json::from_str(cleaned).map_err(schema)?)
        }
        TaskKind::LocateElement => {
            let location: ElementLocation = serde_json::from_str(cleaned).map_err(schema)?;
            if location.found && !((0.0..=1.0).contains(&location.x) && (0.0..=1.0).contains(&location.y)) {
                return Err(AnalysisError::Schema {
                    task,
                    detail: format!("location ({}, {}) is outside 0..1", location.x, location.y),
                });
            }
            Analysis::Location(location)
        }
        TaskKind::MessageComposition => {
            let text = cleaned.trim();
            let text = text
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .unwrap_or(text)
                .trim();
            if text.is_empty() {
                return Err(AnalysisError::Schema {
                    task,
                    detail: "empty message".into(),
                });
            }
            Analysis::Message(ComposedMessage {
                text: text.chars().take(MESSAGE_MAX_CHARS).collect(),
            })
        }
    };
    Ok(analysis)
}

fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fenced_json_is_accepted() {
        let reply = "```json\n{\"is_appropriate\": true, \"reason\": \"travel photo\"}\n```";
        let Analysis::Moderation(verdict) = parse_response(TaskKind::ContentModeration, reply).unwrap() else {
            panic!("wrong variant");
        };
        assert!(verdict.is_safe());
        assert_eq!(verdict.reason, "travel photo");
    }

    #[test]
    fn flagged_content_is_not_safe_even_if_marked_appropriate() {
        let reply = r#"{"is_appropriate": true, "contains_violence": true, "reason": "fight"}"#;
        let Analysis::Moderation(verdict) = parse_response(TaskKind::ContentModeration, reply).unwrap() else {
            panic!("wrong variant");
        };
        assert!(!verdict.is_safe());
    }

    #[test]
    fn profile_fields_default_when_missing() {
        let reply = r#"{"username": "jane.doe", "follower_count": "1.2K", "is_verified": true}"#;
        let Analysis::Profile(info) = parse_response(TaskKind::ProfileOcr, reply).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(info.username, "jane.doe");
        assert_eq!(info.post_count, None);
        assert!(info.summary().contains("Followers: 1.2K"));
        assert!(info.summary().contains("Bio: N/A"));
    }

    #[test]
    fn follow_status_uses_state_names() {
        let reply = r#"{"status": "requested"}"#;
        assert_eq!(
            parse_response(TaskKind::FollowStatusFromImage, reply).unwrap(),
            Analysis::FollowStatus(FollowStatusReading {
                status: RelationshipState::Requested
            })
        );
    }

    #[test]
    fn malformed_reply_is_a_schema_error() {
        let err = parse_response(TaskKind::FollowStatusFromImage, "I think they follow you").unwrap_err();
        assert!(matches!(err, AnalysisError::Schema { .. }));
        assert!(!err.is_retryable());

        let err = parse_response(TaskKind::LocateElement, r#"{"found": true, "x": 540, "y": 0.5}"#).unwrap_err();
        assert!(matches!(err, AnalysisError::Schema { .. }));
    }

    #[test]
    fn composed_message_is_unquoted_and_bounded() {
        let Analysis::Message(msg) = parse_response(TaskKind::MessageComposition, "\"Hi Jane! Loved your trip photos.\"").unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(msg.text, "Hi Jane! Loved your trip photos.");

        let long = "a".repeat(500);
        let Analysis::Message(msg) = parse_response(TaskKind::MessageComposition, &long).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(msg.text.chars().count(), MESSAGE_MAX_CHARS);
    }

    #[test]
    fn image_tasks_reject_text_input() {
        let analyzer = OpenAiAnalyzer::new("k", "m", "http://localhost");
        let err = analyzer
            .build_body(&AnalysisRequest::text(TaskKind::ProfileOcr, "hello"))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidRequest(_)));

        let body = analyzer
            .build_body(&AnalysisRequest::image(TaskKind::ProfileOcr, vec![0x89, b'P', b'N', b'G']))
            .unwrap();
        let url = body["messages"][1]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    struct Flaky {
        failures: Mutex<Vec<AnalysisError>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Analyzer for Flaky {
        async fn analyze(&self, _request: AnalysisRequest) -> Result<Analysis, AnalysisError> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(Analysis::FollowStatus(FollowStatusReading {
                    status: RelationshipState::Following,
                })),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried() {
        let flaky = Flaky {
            failures: Mutex::new(vec![AnalysisError::RateLimited("slow down".into())]),
            calls: Mutex::new(0),
        };
        let request = AnalysisRequest::image(TaskKind::FollowStatusFromImage, vec![]);
        let result = analyze_with_retry(&flaky, request, 3, Duration::from_secs(1)).await;
        assert!(result.is_ok());
        assert_eq!(*flaky.calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_errors_are_not_retried() {
        let flaky = Flaky {
            failures: Mutex::new(vec![AnalysisError::Schema {
                task: TaskKind::ProfileOcr,
                detail: "bad".into(),
            }]),
            calls: Mutex::new(0),
        };
        let request = AnalysisRequest::image(TaskKind::ProfileOcr, vec![]);
        assert!(analyze_with_retry(&flaky, request, 3, Duration::from_secs(1)).await.is_err());
        assert_eq!(*flaky.calls.lock().unwrap(), 1);
    }

    #[test]
    fn error_status_is_read_before_the_body() {
        let html = "<html><body><h1>502 Bad Gateway</h1></body></html>";
        let err = api_error(502, html);
        assert!(matches!(&err, AnalysisError::Api { status: 502, message } if message.contains("Bad Gateway")));
        assert!(err.is_retryable());

        let json = r#"{"error": {"message": "Rate limit reached"}}"#;
        assert_eq!(api_error(429, json), AnalysisError::RateLimited("Rate limit reached".into()));

        let err = api_error(401, "");
        assert_eq!(
            err,
            AnalysisError::Api {
                status: 401,
                message: "empty response body".into()
            }
        );
        assert!(!err.is_retryable());
    }
}
