//! In-memory [`InteractionStore`] backed by [`DashMap`].
//!
//! Used as the default store and in tests. Clone is cheap and all clones
//! share state.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::{
    AnswerQuery, FeedbackKind, Interaction, InteractionStore, StoreError, TemplateIntelligence,
};

/// Shared in-process interaction log.
#[derive(Debug, Clone, Default)]
pub struct MemoryInteractionStore {
    interactions: Arc<DashMap<String, Interaction>>,
    intelligence: Arc<DashMap<String, TemplateIntelligence>>,
}

impl MemoryInteractionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logged interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// `true` when nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Snapshot of every record, oldest first.
    pub fn all(&self) -> Vec<Interaction> {
        let mut records: Vec<Interaction> =
            self.interactions.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

#[async_trait]
impl InteractionStore for MemoryInteractionStore {
    async fn insert(&self, interaction: Interaction) -> Result<(), StoreError> {
        debug!(
            interaction_id = %interaction.id,
            template_id = %interaction.template_id,
            source = %interaction.source_tier,
            "interaction logged (memory)"
        );
        self.interactions.insert(interaction.id.clone(), interaction);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Interaction>, StoreError> {
        Ok(self.interactions.get(id).map(|e| e.value().clone()))
    }

    async fn find_answers(&self, query: &AnswerQuery) -> Result<Vec<Interaction>, StoreError> {
        Ok(self
            .interactions
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn apply_feedback(
        &self,
        id: &str,
        feedback: FeedbackKind,
        score_delta: i64,
    ) -> Result<Interaction, StoreError> {
        let mut entry = self
            .interactions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.user_feedback = Some(feedback);
        entry.learning_score = entry.learning_score.saturating_add(score_delta);
        Ok(entry.value().clone())
    }

    async fn recent_for_template(
        &self,
        template_id: &str,
        since_secs: u64,
    ) -> Result<Vec<Interaction>, StoreError> {
        let mut records: Vec<Interaction> = self
            .interactions
            .iter()
            .filter(|e| e.template_id == template_id && e.created_at >= since_secs)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn active_templates(&self, since_secs: u64) -> Result<Vec<String>, StoreError> {
        let ids: BTreeSet<String> = self
            .interactions
            .iter()
            .filter(|e| e.created_at >= since_secs)
            .map(|e| e.template_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn prune_before(&self, cutoff_secs: u64) -> Result<usize, StoreError> {
        let before = self.interactions.len();
        self.interactions.retain(|_, rec| rec.created_at >= cutoff_secs);
        Ok(before.saturating_sub(self.interactions.len()))
    }

    async fn merge_intelligence(
        &self,
        template_id: &str,
        questions: &[String],
        success_rate: f64,
        now: u64,
    ) -> Result<TemplateIntelligence, StoreError> {
        let mut entry = self
            .intelligence
            .entry(template_id.to_string())
            .or_insert_with(|| TemplateIntelligence::empty(template_id, now));
        entry.absorb_questions(questions.iter().map(String::as_str));
        entry.success_rate = success_rate.clamp(0.0, 100.0);
        entry.last_updated = now;
        Ok(entry.value().clone())
    }

    async fn intelligence(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateIntelligence>, StoreError> {
        Ok(self.intelligence.get(template_id).map(|e| e.value().clone()))
    }

    async fn reset_intelligence(&self, template_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.intelligence.get_mut(template_id) {
            entry.common_questions.clear();
        }
        Ok(())
    }
}
