//! # Interaction Log
//!
//! ## Responsibility
//! Durable log of every question/answer exchange, plus the per-template
//! [`TemplateIntelligence`] aggregate derived from it. The log is the
//! evidence the learned cache promotes answers from.
//!
//! ## Guarantees
//! - Records are never deleted except by [`InteractionStore::prune_before`].
//! - Feedback is applied atomically per record: `user_feedback` and
//!   `learning_score` change together or not at all.
//! - One [`TemplateIntelligence`] row per template; `common_questions` only
//!   grows (deduplicated) until [`InteractionStore::reset_intelligence`].
//!
//! ## NOT Responsible For
//! - Deciding score deltas (that belongs to `feedback`)
//! - Promotion rules (that belongs to `learned`)

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::classify::Category;

pub use memory::MemoryInteractionStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteInteractionStore;

/// Errors produced by an [`InteractionStore`].
///
/// On the read path these are cache-lookup failures and fail open; on the
/// write path they are persistence failures and are logged, never surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("interaction store unavailable: {0}")]
    Unavailable(String),

    /// The referenced record does not exist.
    #[error("interaction '{0}' not found")]
    NotFound(String),

    /// A stored value could not be encoded or decoded.
    #[error("interaction serialization failed: {0}")]
    Serialization(String),

    /// SQLite reported an error.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(String),
}

/// Pipeline tier that produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Promoted from earlier interactions.
    Learned,
    /// Rule-based answer accepted on confidence.
    Fallback,
    /// Answer from the external model.
    External,
    /// External call failed; fallback answer served.
    Error,
    /// No external credential configured; fallback answer served.
    NoApiKey,
    /// The question was a pasted template definition.
    JsonValidation,
    /// The question tried to extract internal instructions.
    DisclosureRefused,
}

impl SourceTier {
    /// Every tier, in pipeline order.
    pub const ALL: [SourceTier; 7] = [
        SourceTier::Learned,
        SourceTier::JsonValidation,
        SourceTier::DisclosureRefused,
        SourceTier::Fallback,
        SourceTier::External,
        SourceTier::Error,
        SourceTier::NoApiKey,
    ];

    /// Stable snake_case label, identical to the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Learned => "learned",
            Self::Fallback => "fallback",
            Self::External => "external",
            Self::Error => "error",
            Self::NoApiKey => "no_api_key",
            Self::JsonValidation => "json_validation",
            Self::DisclosureRefused => "disclosure_refused",
        }
    }

    /// Parse a label produced by [`SourceTier::as_str`].
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == label)
    }

    /// Tiers whose answers may be promoted by the learned cache.
    pub fn is_learnable(&self) -> bool {
        matches!(self, Self::External | Self::Learned)
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit user verdict on an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// The answer helped.
    Helpful,
    /// The answer did not help.
    Unhelpful,
}

impl FeedbackKind {
    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Helpful => "helpful",
            Self::Unhelpful => "unhelpful",
        }
    }

    /// Parse a label produced by [`FeedbackKind::as_str`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "helpful" => Some(Self::Helpful),
            "unhelpful" => Some(Self::Unhelpful),
            _ => None,
        }
    }
}

/// One logged question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Unique id (UUID v4).
    pub id: String,
    /// Template key, or the general-chat sentinel.
    pub template_id: String,
    /// Question as asked.
    pub question: String,
    /// Answer as served.
    pub answer: String,
    /// Asking user, or `"anonymous"`.
    pub user_id: String,
    /// Unix seconds.
    pub created_at: u64,
    /// Tier that produced `answer`.
    pub source_tier: SourceTier,
    /// Topic of `question`.
    pub category: Category,
    /// Advisory score moved by feedback. May go negative.
    pub learning_score: i64,
    /// Latest explicit feedback, if any.
    pub user_feedback: Option<FeedbackKind>,
}

impl Interaction {
    /// Create a fresh record with a new id, zero score, and no feedback.
    pub fn new(
        template_id: impl Into<String>,
        user_id: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
        source_tier: SourceTier,
        category: Category,
        created_at: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.into(),
            question: question.into(),
            answer: answer.into(),
            user_id: user_id.into(),
            created_at,
            source_tier,
            category,
            learning_score: 0,
            user_feedback: None,
        }
    }

    /// Question in the form the learned cache compares on.
    pub fn normalized_question(&self) -> String {
        normalize_question(&self.question)
    }
}

/// Trim and lowercase a question for case-insensitive equality.
pub fn normalize_question(question: &str) -> String {
    question.trim().to_lowercase()
}

/// Aggregate statistics for one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateIntelligence {
    /// Template key.
    pub template_id: String,
    /// Frequently asked questions, deduplicated case-insensitively.
    pub common_questions: Vec<String>,
    /// Percentage (0–100) of recent interactions that went well.
    pub success_rate: f64,
    /// Unix seconds of the last update.
    pub last_updated: u64,
}

impl TemplateIntelligence {
    /// An empty aggregate.
    pub fn empty(template_id: impl Into<String>, now: u64) -> Self {
        Self {
            template_id: template_id.into(),
            common_questions: Vec::new(),
            success_rate: 100.0,
            last_updated: now,
        }
    }

    /// Append questions not yet present; returns how many were added.
    pub fn absorb_questions<'a, I>(&mut self, questions: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut added = 0;
        for q in questions {
            let norm = normalize_question(q);
            if norm.is_empty() {
                continue;
            }
            if !self
                .common_questions
                .iter()
                .any(|existing| normalize_question(existing) == norm)
            {
                self.common_questions.push(q.trim().to_string());
                added += 1;
            }
        }
        added
    }
}

/// Filter for learned-cache candidate lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerQuery {
    /// Output of [`normalize_question`].
    pub normalized_question: String,
    /// Exact template key.
    pub template_id: String,
    /// Only records created at or after this Unix second.
    pub since_secs: u64,
    /// Only records from these tiers.
    pub tiers: Vec<SourceTier>,
}

impl AnswerQuery {
    /// `true` if `record` satisfies every filter.
    pub fn matches(&self, record: &Interaction) -> bool {
        record.template_id == self.template_id
            && record.created_at >= self.since_secs
            && self.tiers.contains(&record.source_tier)
            && record.normalized_question() == self.normalized_question
    }
}

/// Persistence boundary for interactions and template aggregates.
///
/// The in-memory [`MemoryInteractionStore`] is the default; a host
/// relational database is another valid implementation.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Append a record.
    async fn insert(&self, interaction: Interaction) -> Result<(), StoreError>;

    /// Fetch one record by id.
    async fn get(&self, id: &str) -> Result<Option<Interaction>, StoreError>;

    /// Records matching `query`, any order.
    async fn find_answers(&self, query: &AnswerQuery) -> Result<Vec<Interaction>, StoreError>;

    /// Set `user_feedback` and add `score_delta` to `learning_score` in one
    /// step. Returns the updated record.
    async fn apply_feedback(
        &self,
        id: &str,
        feedback: FeedbackKind,
        score_delta: i64,
    ) -> Result<Interaction, StoreError>;

    /// Records for `template_id` created at or after `since_secs`.
    async fn recent_for_template(
        &self,
        template_id: &str,
        since_secs: u64,
    ) -> Result<Vec<Interaction>, StoreError>;

    /// Distinct template ids with records at or after `since_secs`.
    async fn active_templates(&self, since_secs: u64) -> Result<Vec<String>, StoreError>;

    /// Delete records created before `cutoff_secs`; returns how many.
    async fn prune_before(&self, cutoff_secs: u64) -> Result<usize, StoreError>;

    /// Merge into the template's aggregate: append unseen `questions`, set
    /// `success_rate`, stamp `now`. Creates the row if missing.
    async fn merge_intelligence(
        &self,
        template_id: &str,
        questions: &[String],
        success_rate: f64,
        now: u64,
    ) -> Result<TemplateIntelligence, StoreError>;

    /// The template's aggregate, if any.
    async fn intelligence(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateIntelligence>, StoreError>;

    /// Clear `common_questions` for the template.
    async fn reset_intelligence(&self, template_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_labels_round_trip() {
        for tier in SourceTier::ALL {
            assert_eq!(SourceTier::from_label(tier.as_str()), Some(tier));
            let json = serde_json::to_string(&tier).expect("serialize");
            assert_eq!(json, format!("\"{}\"", tier.as_str()));
        }
        assert_eq!(SourceTier::from_label("bogus"), None);
    }

    #[test]
    fn test_only_external_and_learned_are_learnable() {
        let learnable: Vec<_> = SourceTier::ALL
            .into_iter()
            .filter(SourceTier::is_learnable)
            .collect();
        assert_eq!(learnable, vec![SourceTier::Learned, SourceTier::External]);
    }

    #[test]
    fn test_new_interaction_defaults() {
        let rec = Interaction::new(
            "T1",
            "u1",
            "Q",
            "A",
            SourceTier::External,
            Category::General,
            42,
        );
        assert_eq!(rec.learning_score, 0);
        assert_eq!(rec.user_feedback, None);
        assert_eq!(rec.created_at, 42);
        assert!(Uuid::parse_str(&rec.id).is_ok());
    }

    #[test]
    fn test_absorb_questions_dedups_case_insensitively() {
        let mut intel = TemplateIntelligence::empty("T1", 0);
        assert_eq!(intel.absorb_questions(["How do I test?", "  how do i TEST?  "]), 1);
        assert_eq!(intel.absorb_questions(["", "New one"]), 1);
        assert_eq!(intel.common_questions, vec!["How do I test?", "New one"]);
    }

    #[test]
    fn test_answer_query_matches_all_filters() {
        let rec = Interaction::new(
            "T1",
            "u1",
            "  Hello There ",
            "A",
            SourceTier::External,
            Category::General,
            100,
        );
        let query = AnswerQuery {
            normalized_question: "hello there".into(),
            template_id: "T1".into(),
            since_secs: 50,
            tiers: vec![SourceTier::External],
        };
        assert!(query.matches(&rec));

        let too_new = AnswerQuery {
            since_secs: 101,
            ..query.clone()
        };
        assert!(!too_new.matches(&rec));

        let other_template = AnswerQuery {
            template_id: "T2".into(),
            ..query.clone()
        };
        assert!(!other_template.matches(&rec));

        let other_tier = AnswerQuery {
            tiers: vec![SourceTier::Fallback],
            ..query
        };
        assert!(!other_tier.matches(&rec));
    }
}
