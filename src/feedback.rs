//! # Stage: Feedback Ingestion
//!
//! ## Responsibility
//!
//! Validate an explicit user verdict on a served answer and apply it to the
//! referenced [`Interaction`]: record `userFeedback` and move the advisory
//! `learningScore`.
//!
//! ## Guarantees
//!
//! - **Validated at the boundary**: a malformed or contradictory request is
//!   rejected before any store access, and nothing is mutated on rejection.
//! - **Scored by tier**: helpful feedback adds +2 only to `external` records;
//!   unhelpful feedback subtracts 1 from any record.
//! - **Repeatable**: each call applies again; the latest verdict wins.
//!
//! ## NOT Responsible For
//!
//! - Learned-cache promotion (that reads `userFeedback` directly)
//! - The HTTP surface that delivers the request

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::interaction::{FeedbackKind, Interaction, InteractionStore, SourceTier, StoreError};

/// Score added when an external answer is marked helpful.
pub const HELPFUL_EXTERNAL_DELTA: i64 = 2;
/// Score added when any answer is marked unhelpful.
pub const UNHELPFUL_DELTA: i64 = -1;

/// Errors produced while applying feedback.
#[derive(Error, Debug)]
pub enum FeedbackError {
    /// The request is missing fields or contradicts itself.
    #[error("malformed feedback request: {0}")]
    Malformed(String),

    /// No interaction has the given id.
    #[error("unknown interaction: {0}")]
    UnknownInteraction(String),

    /// The store failed while reading or updating the record.
    #[error("feedback storage error: {0}")]
    Storage(#[from] StoreError),
}

impl FeedbackError {
    /// `true` when the caller sent something invalid (a 4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::UnknownInteraction(_))
    }
}

/// Inbound feedback payload.
///
/// ```json
/// {"interactionId": "…", "feedback": "unhelpful", "helpful": false}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedbackRequest {
    /// Id returned with the answer.
    pub interaction_id: String,
    /// Verdict.
    pub feedback: FeedbackKind,
    /// Boolean form of the verdict; must agree with `feedback`.
    pub helpful: bool,
}

impl FeedbackRequest {
    /// A consistent request for `interaction_id`.
    pub fn new(interaction_id: impl Into<String>, feedback: FeedbackKind) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            helpful: feedback == FeedbackKind::Helpful,
            feedback,
        }
    }

    /// Parse and validate a JSON body.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::Malformed`] when the JSON does not match the schema
    /// or fails [`FeedbackRequest::validate`].
    pub fn from_json(body: &str) -> Result<Self, FeedbackError> {
        let req: Self =
            serde_json::from_str(body).map_err(|e| FeedbackError::Malformed(e.to_string()))?;
        req.validate()?;
        Ok(req)
    }

    /// Check the request is internally consistent.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::Malformed`] when `interactionId` is blank or
    /// `helpful` disagrees with `feedback`.
    pub fn validate(&self) -> Result<(), FeedbackError> {
        if self.interaction_id.trim().is_empty() {
            return Err(FeedbackError::Malformed("interactionId is required".into()));
        }
        if self.helpful != (self.feedback == FeedbackKind::Helpful) {
            return Err(FeedbackError::Malformed(format!(
                "helpful={} contradicts feedback={}",
                self.helpful,
                self.feedback.as_str()
            )));
        }
        Ok(())
    }
}

/// Score change for `feedback` on a record served from `tier`.
pub fn score_delta(tier: SourceTier, feedback: FeedbackKind) -> i64 {
    match (feedback, tier) {
        (FeedbackKind::Helpful, SourceTier::External) => HELPFUL_EXTERNAL_DELTA,
        (FeedbackKind::Helpful, _) => 0,
        (FeedbackKind::Unhelpful, _) => UNHELPFUL_DELTA,
    }
}

/// Validate `req` and apply it to the referenced record.
///
/// Returns the updated record.
///
/// # Errors
///
/// - [`FeedbackError::Malformed`] for an invalid request.
/// - [`FeedbackError::UnknownInteraction`] when no record has the id.
/// - [`FeedbackError::Storage`] when the store fails.
pub async fn apply_feedback(
    store: &dyn InteractionStore,
    req: &FeedbackRequest,
) -> Result<Interaction, FeedbackError> {
    req.validate()?;
    let id = req.interaction_id.trim();
    let record = store
        .get(id)
        .await?
        .ok_or_else(|| FeedbackError::UnknownInteraction(id.to_string()))?;

    let delta = score_delta(record.source_tier, req.feedback);
    let updated = store
        .apply_feedback(id, req.feedback, delta)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(id) => FeedbackError::UnknownInteraction(id),
            other => FeedbackError::Storage(other),
        })?;

    info!(
        interaction_id = %id,
        feedback = req.feedback.as_str(),
        tier = %updated.source_tier,
        delta,
        learning_score = updated.learning_score,
        "feedback applied"
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Category;
    use crate::interaction::MemoryInteractionStore;

    async fn seeded(tier: SourceTier) -> (MemoryInteractionStore, String) {
        let store = MemoryInteractionStore::new();
        let record = Interaction::new("T1", "u", "q?", "a.", tier, Category::General, 10);
        let id = record.id.clone();
        store.insert(record).await.expect("insert");
        (store, id)
    }

    #[test]
    fn test_score_delta_table() {
        assert_eq!(score_delta(SourceTier::External, FeedbackKind::Helpful), 2);
        assert_eq!(score_delta(SourceTier::Fallback, FeedbackKind::Helpful), 0);
        assert_eq!(score_delta(SourceTier::Learned, FeedbackKind::Helpful), 0);
        for tier in SourceTier::ALL {
            assert_eq!(score_delta(tier, FeedbackKind::Unhelpful), -1);
        }
    }

    #[test]
    fn test_from_json_accepts_valid_body() {
        let req = FeedbackRequest::from_json(
            r#"{"interactionId": "abc", "feedback": "helpful", "helpful": true}"#,
        )
        .expect("valid");
        assert_eq!(req, FeedbackRequest::new("abc", FeedbackKind::Helpful));
    }

    #[test]
    fn test_from_json_rejects_bad_bodies() {
        let bodies = [
            r#"{"interactionId": "abc", "feedback": "great", "helpful": true}"#,
            r#"{"interactionId": "abc", "feedback": "helpful"}"#,
            r#"{"interactionId": "", "feedback": "helpful", "helpful": true}"#,
            r#"{"interactionId": "abc", "feedback": "helpful", "helpful": false}"#,
            r#"{"interactionId": "abc", "feedback": "helpful", "helpful": true, "x": 1}"#,
            "not json",
        ];
        for body in bodies {
            let err = FeedbackRequest::from_json(body).unwrap_err();
            assert!(matches!(err, FeedbackError::Malformed(_)), "{body}");
            assert!(err.is_client_error());
        }
    }

    #[tokio::test]
    async fn test_unhelpful_decrements_by_one_and_keeps_text() {
        let (store, id) = seeded(SourceTier::Fallback).await;
        let updated = apply_feedback(&store, &FeedbackRequest::new(&id, FeedbackKind::Unhelpful))
            .await
            .expect("apply");
        assert_eq!(updated.learning_score, -1);
        assert_eq!(updated.user_feedback, Some(FeedbackKind::Unhelpful));
        assert_eq!(updated.question, "q?");
        assert_eq!(updated.answer, "a.");
    }

    #[tokio::test]
    async fn test_helpful_external_adds_two_each_time() {
        let (store, id) = seeded(SourceTier::External).await;
        let req = FeedbackRequest::new(&id, FeedbackKind::Helpful);
        apply_feedback(&store, &req).await.expect("first");
        let updated = apply_feedback(&store, &req).await.expect("second");
        assert_eq!(updated.learning_score, 4);
    }

    #[tokio::test]
    async fn test_unknown_id_rejected() {
        let (store, _) = seeded(SourceTier::External).await;
        let err = apply_feedback(&store, &FeedbackRequest::new("missing", FeedbackKind::Helpful))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::UnknownInteraction(_)));
    }

    #[tokio::test]
    async fn test_contradictory_request_mutates_nothing() {
        let (store, id) = seeded(SourceTier::External).await;
        let req = FeedbackRequest {
            interaction_id: id.clone(),
            feedback: FeedbackKind::Helpful,
            helpful: false,
        };
        assert!(apply_feedback(&store, &req).await.is_err());
        let record = store.get(&id).await.expect("get").expect("present");
        assert_eq!(record.learning_score, 0);
        assert!(record.user_feedback.is_none());
    }
}
