//! # learned-response-router
//!
//! Answers end-user setup questions about deploying automation templates
//! while keeping calls to a paid external language model to a minimum.
//!
//! ## Architecture
//!
//! Every question walks one decision pipeline; the first tier that can answer
//! terminates it:
//! ```text
//! RouteRequest → LearnedResponseCache → JSON-template guard → disclosure guard
//!              → SmartFallbackGenerator (confidence > 0.8) → ExternalAnswerClient
//!              → fallback answer on failure
//! ```
//! Each terminal state logs one [`Interaction`](interaction::Interaction),
//! which feeds later learned-cache promotions, and updates the per
//! (user, template) [`ConversationState`](conversation::ConversationState).
//!
//! Two maintenance jobs run beside request handling (see [`scheduler`]): an
//! hourly conversation sweep and a six-hourly prune-and-refresh of the
//! interaction log.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod classify;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod external;
pub mod fallback;
pub mod feedback;
pub mod guards;
pub mod intelligence;
pub mod interaction;
pub mod learned;
pub mod metrics;
pub mod router;
pub mod scheduler;

// Re-exports for convenience
pub use conversation::{ConversationProgress, ConversationStateStore, MemoryConversationStore};
pub use external::{AnswerModel, ExternalAnswerClient, OpenAiChatModel};
pub use fallback::SmartFallbackGenerator;
pub use feedback::{FeedbackError, FeedbackRequest};
pub use interaction::{
    FeedbackKind, Interaction, InteractionStore, MemoryInteractionStore, SourceTier,
};
pub use learned::LearnedResponseCache;
pub use router::{ResponseRouter, RouteState};

/// Template id used when a question is not tied to a template.
pub const GENERAL_TEMPLATE_ID: &str = "general";

/// User id used when the caller is not signed in.
pub const ANONYMOUS_USER_ID: &str = "anonymous";

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`EngineError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), EngineError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| EngineError::Other(format!("tracing init failed: {e}")))
}

/// Top-level engine errors.
///
/// Each component keeps its own error enum; this wraps them for callers
/// that drive the engine as a whole (the demo binary, host integrations).
#[derive(Error, Debug)]
pub enum EngineError {
    /// A routing request failed boundary validation.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A feedback call was rejected or could not be applied.
    #[error(transparent)]
    Feedback(#[from] feedback::FeedbackError),

    /// The interaction store failed.
    #[error(transparent)]
    Store(#[from] interaction::StoreError),

    /// Conversation snapshot persistence failed.
    #[error(transparent)]
    Snapshot(#[from] conversation::SnapshotError),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] config::validation::ConfigError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// `true` when the caller sent something invalid (a 4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Feedback(e) => e.is_client_error(),
            _ => false,
        }
    }
}

/// Rejection of a malformed routing request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The question was empty or whitespace only.
    #[error("question must not be empty")]
    EmptyQuestion,
}

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The end user.
    User,
    /// The assistant.
    Assistant,
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who spoke.
    pub role: TurnRole,
    /// What was said.
    pub content: String,
}

impl Turn {
    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Template the question is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContext {
    /// Template key; absent for general chat.
    #[serde(default)]
    pub template_id: Option<String>,
}

/// Inbound routing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    /// The user's current question.
    pub question: String,
    /// Earlier turns, oldest first. Does not include `question`.
    #[serde(default)]
    pub conversation_history: Vec<Turn>,
    /// Template the conversation is about.
    #[serde(default)]
    pub template_context: TemplateContext,
    /// Caller identity; `None` means anonymous.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RouteRequest {
    /// Build a request with no history for the given template.
    pub fn new(question: impl Into<String>, template_id: Option<&str>) -> Self {
        Self {
            question: question.into(),
            conversation_history: Vec::new(),
            template_context: TemplateContext {
                template_id: template_id.map(str::to_string),
            },
            user_id: None,
        }
    }

    /// Set the caller identity.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the prior conversation.
    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.conversation_history = history;
        self
    }

    /// Template id with the general-chat sentinel substituted for blanks.
    pub fn template_id(&self) -> &str {
        match self.template_context.template_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id,
            _ => GENERAL_TEMPLATE_ID,
        }
    }

    /// User id with the anonymous sentinel substituted for blanks.
    pub fn user_id(&self) -> &str {
        match self.user_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id,
            _ => ANONYMOUS_USER_ID,
        }
    }

    /// Check the request at the boundary.
    ///
    /// # Errors
    ///
    /// [`RequestError::EmptyQuestion`] for a blank question. Length is not
    /// checked here: pasted template JSON must reach the template guard.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.question.trim().is_empty() {
            return Err(RequestError::EmptyQuestion);
        }
        Ok(())
    }

    /// User-authored turns, oldest first, ending with the current question.
    pub fn user_turns(&self) -> impl Iterator<Item = &str> {
        self.conversation_history
            .iter()
            .filter(|t| t.role == TurnRole::User)
            .map(|t| t.content.as_str())
            .chain(std::iter::once(self.question.as_str()))
    }
}

/// Answer returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    /// Answer text; never empty.
    pub answer: String,
    /// Tier that produced the answer.
    pub source: SourceTier,
    /// Confidence for non-external tiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Id of the logged interaction, for feedback. `None` if logging failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Advisory setup progress. Absent for refused questions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ConversationProgress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_request_sentinels() {
        let req = RouteRequest::new("hi", None);
        assert_eq!(req.template_id(), GENERAL_TEMPLATE_ID);
        assert_eq!(req.user_id(), ANONYMOUS_USER_ID);

        let req = RouteRequest::new("hi", Some("  ")).with_user("");
        assert_eq!(req.template_id(), GENERAL_TEMPLATE_ID);
        assert_eq!(req.user_id(), ANONYMOUS_USER_ID);

        let req = RouteRequest::new("hi", Some("T1")).with_user("u-7");
        assert_eq!(req.template_id(), "T1");
        assert_eq!(req.user_id(), "u-7");
    }

    #[test]
    fn test_validate_rejects_blank_accepts_long_questions() {
        assert_eq!(
            RouteRequest::new("   ", None).validate(),
            Err(RequestError::EmptyQuestion)
        );
        assert!(RouteRequest::new("short", None).validate().is_ok());
        assert!(RouteRequest::new("x".repeat(20_000), None).validate().is_ok());
    }

    #[test]
    fn test_user_turns_end_with_question() {
        let req = RouteRequest::new("third", None).with_history(vec![
            Turn::user("first"),
            Turn::assistant("reply"),
            Turn::user("second"),
        ]);
        let turns: Vec<&str> = req.user_turns().collect();
        assert_eq!(turns, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_route_request_deserializes_camel_case() {
        let json = r#"{
            "question": "How do I test?",
            "conversationHistory": [{"role": "user", "content": "hi"}],
            "templateContext": {"templateId": "T1"},
            "userId": "u1"
        }"#;
        let req: RouteRequest = match serde_json::from_str(json) {
            Ok(r) => r,
            Err(e) => unreachable!("valid payload failed to parse: {e}"),
        };
        assert_eq!(req.template_id(), "T1");
        assert_eq!(req.conversation_history.len(), 1);
    }

    #[test]
    fn test_request_error_is_client_error() {
        let err: EngineError = RequestError::EmptyQuestion.into();
        assert!(err.is_client_error());
        assert!(!EngineError::Other("x".into()).is_client_error());
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
