//! # Stage: Learned Response Cache
//!
//! ## Responsibility
//! Serve an answer from history when the same question (case-insensitive)
//! has been answered for the same template often enough, with enough
//! positive feedback, inside the lookup window.
//!
//! ## Algorithm
//! 1. Load records with the same normalized question and template, tier
//!    `external` or `learned`, created within `window_days`.
//! 2. Group by answer text. For each group: `usage_count` = records,
//!    `helpfulness` = helpful / records-with-feedback (0 with no feedback).
//! 3. Keep groups with `usage_count >= min_usage` and
//!    `helpfulness > min_helpfulness`.
//! 4. Pick the highest `(usage_count, helpfulness)`; ties go to the group
//!    used most recently.
//! 5. `confidence = min(max_confidence, helpfulness * usage_count / 10)`.
//!
//! ## Guarantees
//! - Fail-open: a store error is logged and reported as a miss.
//! - Read-only: lookups never mutate the log.
//!
//! ## NOT Responsible For
//! - Logging the served answer (that belongs to `router`)
//! - Learning scores; inclusion depends only on feedback and usage

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::LearnedConfig;
use crate::interaction::{
    normalize_question, AnswerQuery, FeedbackKind, Interaction, InteractionStore, SourceTier,
};
use crate::metrics;

/// A promoted answer.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnedAnswer {
    /// Answer text served before.
    pub answer: String,
    /// `min(max_confidence, helpfulness * usage_count / 10)`.
    pub confidence: f64,
    /// Records in the winning group.
    pub usage_count: usize,
    /// Helpful share among rated records in the group.
    pub helpfulness: f64,
}

#[derive(Debug, Default)]
struct AnswerGroup<'a> {
    answer: &'a str,
    usage_count: usize,
    rated: usize,
    helpful: usize,
    newest: u64,
}

impl AnswerGroup<'_> {
    fn helpfulness(&self) -> f64 {
        if self.rated == 0 {
            0.0
        } else {
            self.helpful as f64 / self.rated as f64
        }
    }
}

/// Pick the promoted answer from candidate records, if any qualifies.
///
/// `records` must already be filtered by question, template, tier, and
/// window; this function only groups and ranks.
pub fn select_learned(records: &[Interaction], config: &LearnedConfig) -> Option<LearnedAnswer> {
    let mut groups: HashMap<&str, AnswerGroup<'_>> = HashMap::new();
    for rec in records {
        let group = groups
            .entry(rec.answer.as_str())
            .or_insert_with(|| AnswerGroup {
                answer: rec.answer.as_str(),
                ..AnswerGroup::default()
            });
        group.usage_count += 1;
        group.newest = group.newest.max(rec.created_at);
        match rec.user_feedback {
            Some(FeedbackKind::Helpful) => {
                group.rated += 1;
                group.helpful += 1;
            }
            Some(FeedbackKind::Unhelpful) => group.rated += 1,
            None => {}
        }
    }

    let best = groups
        .into_values()
        .filter(|g| g.usage_count >= config.min_usage && g.helpfulness() > config.min_helpfulness)
        .max_by(|a, b| {
            a.usage_count
                .cmp(&b.usage_count)
                .then(a.helpfulness().total_cmp(&b.helpfulness()))
                .then(a.newest.cmp(&b.newest))
        })?;

    let helpfulness = best.helpfulness();
    let confidence = (helpfulness * best.usage_count as f64 / 10.0).min(config.max_confidence);
    Some(LearnedAnswer {
        answer: best.answer.to_string(),
        confidence,
        usage_count: best.usage_count,
        helpfulness,
    })
}

/// Read path over the interaction log that serves promoted answers.
#[derive(Clone)]
pub struct LearnedResponseCache {
    store: Arc<dyn InteractionStore>,
    clock: Arc<dyn Clock>,
    config: LearnedConfig,
}

impl std::fmt::Debug for LearnedResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearnedResponseCache")
            .field("config", &self.config)
            .finish()
    }
}

impl LearnedResponseCache {
    /// Create a cache over `store`.
    pub fn new(
        store: Arc<dyn InteractionStore>,
        clock: Arc<dyn Clock>,
        config: LearnedConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Look up a promoted answer for `question` under `template_id`.
    ///
    /// Returns `None` on a miss and on any storage failure.
    pub async fn lookup(&self, question: &str, template_id: &str) -> Option<LearnedAnswer> {
        let now = self.clock.now_secs();
        let query = AnswerQuery {
            normalized_question: normalize_question(question),
            template_id: template_id.to_string(),
            since_secs: now.saturating_sub(self.config.window_secs()),
            tiers: SourceTier::ALL
                .into_iter()
                .filter(SourceTier::is_learnable)
                .collect(),
        };

        let records = match self.store.find_answers(&query).await {
            Ok(records) => records,
            Err(e) => {
                warn!(template_id, error = %e, "learned lookup failed, continuing without cache");
                metrics::record_learned_lookup("error");
                return None;
            }
        };

        match select_learned(&records, &self.config) {
            Some(hit) => {
                debug!(
                    template_id,
                    usage_count = hit.usage_count,
                    helpfulness = hit.helpfulness,
                    confidence = hit.confidence,
                    "learned cache hit"
                );
                metrics::record_learned_lookup("hit");
                Some(hit)
            }
            None => {
                debug!(template_id, candidates = records.len(), "learned cache miss");
                metrics::record_learned_lookup("miss");
                None
            }
        }
    }
}
