//! # Stage: Template Intelligence
//!
//! ## Responsibility
//! Keep the per-template aggregate ([`TemplateIntelligence`]) current and the
//! interaction log bounded:
//! - after every successful external answer, add the question to
//!   `commonQuestions` and recompute `successRate`;
//! - on the periodic prune-and-refresh, delete records past retention and
//!   recompute every active template, promoting questions asked repeatedly.
//!
//! ## Guarantees
//! - Idempotent: running a refresh twice with no new traffic changes nothing
//!   but `lastUpdated`.
//! - Grow-only questions: `commonQuestions` is deduplicated case-insensitively
//!   and only shrinks through an explicit reset.
//!
//! ## NOT Responsible For
//! - Learned-cache promotion (that reads interactions directly)
//! - Scheduling (that belongs to `scheduler`)

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::interaction::{
    FeedbackKind, Interaction, InteractionStore, SourceTier, StoreError, TemplateIntelligence,
};
use crate::metrics;

/// Percentage of `records` that were not errors and not marked unhelpful.
/// An empty window counts as 100.
pub fn success_rate(records: &[Interaction]) -> f64 {
    if records.is_empty() {
        return 100.0;
    }
    let ok = records
        .iter()
        .filter(|r| {
            r.source_tier != SourceTier::Error && r.user_feedback != Some(FeedbackKind::Unhelpful)
        })
        .count();
    ok as f64 * 100.0 / records.len() as f64
}

/// Questions asked at least `min_count` times (case-insensitively), most
/// frequent first. Each is reported in the wording of its earliest record.
pub fn common_questions(records: &[Interaction], min_count: usize) -> Vec<String> {
    let mut groups: HashMap<String, (usize, u64, &str)> = HashMap::new();
    for r in records {
        let slot = groups
            .entry(r.normalized_question())
            .or_insert((0, r.created_at, r.question.trim()));
        slot.0 += 1;
        if r.created_at < slot.1 {
            slot.1 = r.created_at;
            slot.2 = r.question.trim();
        }
    }
    let mut frequent: Vec<(usize, String)> = groups
        .into_values()
        .filter(|(count, _, _)| *count >= min_count)
        .map(|(count, _, text)| (count, text.to_string()))
        .collect();
    frequent.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    frequent.into_iter().map(|(_, q)| q).collect()
}

/// Outcome of one prune-and-refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Records deleted by retention.
    pub pruned: usize,
    /// Templates whose aggregate was recomputed.
    pub templates_refreshed: usize,
}

/// Maintains [`TemplateIntelligence`] rows from the interaction log.
#[derive(Clone)]
pub struct TemplateLearner {
    store: Arc<dyn InteractionStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl TemplateLearner {
    /// Create a learner over `store`.
    pub fn new(
        store: Arc<dyn InteractionStore>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn window_start(&self, now: u64) -> u64 {
        now.saturating_sub(self.config.intelligence_window_secs())
    }

    /// Fold one successful external answer into the template's aggregate.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`]; the router logs and swallows it.
    pub async fn record_external_success(
        &self,
        template_id: &str,
        question: &str,
    ) -> Result<TemplateIntelligence, StoreError> {
        let now = self.clock.now_secs();
        let recent = self
            .store
            .recent_for_template(template_id, self.window_start(now))
            .await?;
        let rate = success_rate(&recent);
        let row = self
            .store
            .merge_intelligence(template_id, &[question.trim().to_string()], rate, now)
            .await?;
        debug!(
            template_id,
            success_rate = rate,
            common_questions = row.common_questions.len(),
            "template intelligence updated"
        );
        Ok(row)
    }

    /// Recompute the aggregate for one template.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`].
    pub async fn refresh_template(
        &self,
        template_id: &str,
    ) -> Result<TemplateIntelligence, StoreError> {
        let now = self.clock.now_secs();
        let recent = self
            .store
            .recent_for_template(template_id, self.window_start(now))
            .await?;
        let questions = common_questions(&recent, self.config.common_question_min_count);
        self.store
            .merge_intelligence(template_id, &questions, success_rate(&recent), now)
            .await
    }

    /// Delete records past retention, then refresh every template active in
    /// the intelligence window.
    ///
    /// # Errors
    ///
    /// Propagates the first [`StoreError`].
    pub async fn prune_and_refresh(&self) -> Result<RefreshReport, StoreError> {
        let now = self.clock.now_secs();
        let cutoff = now.saturating_sub(self.config.retention_secs());
        let pruned = self.store.prune_before(cutoff).await?;
        metrics::add_interactions_pruned(pruned);

        let templates = self.store.active_templates(self.window_start(now)).await?;
        for template_id in &templates {
            self.refresh_template(template_id).await?;
        }
        let report = RefreshReport {
            pruned,
            templates_refreshed: templates.len(),
        };
        info!(
            pruned = report.pruned,
            templates = report.templates_refreshed,
            "prune and refresh complete"
        );
        Ok(report)
    }

    /// Current aggregate for `template_id`, if any.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`].
    pub async fn intelligence(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateIntelligence>, StoreError> {
        self.store.intelligence(template_id).await
    }

    /// Clear `commonQuestions` for `template_id`.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`].
    pub async fn reset(&self, template_id: &str) -> Result<(), StoreError> {
        self.store.reset_intelligence(template_id).await
    }
}

impl std::fmt::Debug for TemplateLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateLearner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Category;
    use crate::clock::{ManualClock, DAY_SECS};
    use crate::interaction::MemoryInteractionStore;

    fn rec(q: &str, tier: SourceTier, at: u64) -> Interaction {
        Interaction::new("T1", "u", q, "a", tier, Category::General, at)
    }

    #[test]
    fn test_success_rate_empty_is_100() {
        assert!((success_rate(&[]) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_rate_counts_errors_and_unhelpful() {
        let mut unhelpful = rec("q", SourceTier::External, 1);
        unhelpful.user_feedback = Some(FeedbackKind::Unhelpful);
        let records = vec![
            rec("q", SourceTier::External, 1),
            rec("q", SourceTier::Fallback, 1),
            rec("q", SourceTier::Error, 1),
            unhelpful,
        ];
        assert!((success_rate(&records) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_common_questions_threshold_and_wording() {
        let records = vec![
            rec("How do I test?", SourceTier::Fallback, 5),
            rec("how do i test?", SourceTier::External, 9),
            rec("What is this?", SourceTier::External, 3),
            rec("  HOW DO I TEST?  ", SourceTier::Error, 7),
        ];
        assert_eq!(common_questions(&records, 2), vec!["How do I test?".to_string()]);
        assert_eq!(common_questions(&records, 1).len(), 2);
        assert!(common_questions(&records, 4).is_empty());
    }

    fn learner(store: Arc<MemoryInteractionStore>, clock: Arc<ManualClock>) -> TemplateLearner {
        TemplateLearner::new(store, clock, RetentionConfig::default())
    }

    #[tokio::test]
    async fn test_record_external_success_adds_question_once() {
        let store = Arc::new(MemoryInteractionStore::new());
        let clock = Arc::new(ManualClock::new(100 * DAY_SECS));
        let l = learner(store.clone(), clock);
        l.record_external_success("T1", "How do I deploy?").await.expect("first");
        let row = l
            .record_external_success("T1", "how do i deploy?")
            .await
            .expect("second");
        assert_eq!(row.common_questions, vec!["How do I deploy?".to_string()]);
        assert!((row.success_rate - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_prune_and_refresh_removes_old_and_promotes_repeats() {
        let store = Arc::new(MemoryInteractionStore::new());
        let now = 200 * DAY_SECS;
        let clock = Arc::new(ManualClock::new(now));
        store
            .insert(rec("ancient", SourceTier::External, now - 91 * DAY_SECS))
            .await
            .expect("insert");
        for _ in 0..2 {
            store
                .insert(rec("Where is the webhook URL?", SourceTier::Fallback, now - DAY_SECS))
                .await
                .expect("insert");
        }
        store
            .insert(rec("once", SourceTier::Error, now - DAY_SECS))
            .await
            .expect("insert");

        let l = learner(store.clone(), clock);
        let report = l.prune_and_refresh().await.expect("refresh");
        assert_eq!(report, RefreshReport { pruned: 1, templates_refreshed: 1 });
        assert_eq!(store.len(), 3);

        let row = l.intelligence("T1").await.expect("read").expect("row");
        assert_eq!(row.common_questions, vec!["Where is the webhook URL?".to_string()]);
        assert!((row.success_rate - 200.0 / 3.0).abs() < 1e-9);

        let again = l.prune_and_refresh().await.expect("idempotent");
        assert_eq!(again.pruned, 0);
        let row2 = l.intelligence("T1").await.expect("read").expect("row");
        assert_eq!(row2.common_questions, row.common_questions);
    }

    #[tokio::test]
    async fn test_reset_clears_questions() {
        let store = Arc::new(MemoryInteractionStore::new());
        let clock = Arc::new(ManualClock::new(DAY_SECS));
        let l = learner(store, clock);
        l.record_external_success("T1", "q").await.expect("record");
        l.reset("T1").await.expect("reset");
        let row = l.intelligence("T1").await.expect("read").expect("row");
        assert!(row.common_questions.is_empty());
    }
}
