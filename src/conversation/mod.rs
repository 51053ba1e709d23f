//! # Stage: Conversation State
//!
//! ## Responsibility
//! Track per-(user, template) progress through the setup phases so the
//! router can tell the user, and the external model, which steps are already
//! settled instead of re-asking them.
//!
//! ## Guarantees
//! - Expiring: an entry idle for more than the TTL (24h by default) is never
//!   returned and is removed by the next [`ConversationStateStore::sweep`].
//! - Bounded: inserting a new key into a full store evicts the least recently
//!   active entry.
//! - Injectable: the store is a trait object with an injected clock, so tests
//!   substitute a [`ManualClock`](crate::clock::ManualClock).
//! - Restart-tolerant: [`ConversationStateStore::flush`] writes live entries to
//!   a snapshot and [`ConversationStateStore::restore`] reloads the unexpired
//!   ones; the write is last-writer-wins, not transactional.
//!
//! ## NOT Responsible For
//! - Deciding which tier answers (progress is advisory only)
//! - Scheduling the sweep (that belongs to `scheduler`)

pub mod memory;
pub mod snapshot;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classify::Phase;

pub use memory::MemoryConversationStore;
pub use snapshot::{
    ConversationSnapshot, JsonFileSnapshot, MemorySnapshot, NoSnapshot, SnapshotError,
    StateSnapshotStore,
};

/// Interactions required before completion is offered.
pub const COMPLETION_MIN_INTERACTIONS: u32 = 3;
/// Essential-step percentage required before completion is offered.
pub const COMPLETION_MIN_PERCENTAGE: u8 = 80;

/// Store key for a (user, template) pair. Both ids are opaque, so they are
/// kept apart rather than joined with a separator.
pub type StateKey = (String, String);

/// Key for `user_id` and `template_id`.
pub fn state_key(user_id: &str, template_id: &str) -> StateKey {
    (user_id.to_string(), template_id.to_string())
}

/// Progress of one (user, template) conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Opaque user id.
    pub user_id: String,
    /// Opaque template id.
    pub template_id: String,
    /// First interaction, Unix seconds.
    pub start_time: u64,
    /// Interactions recorded so far.
    pub interaction_count: u32,
    /// Phases the user has reached.
    pub completed_steps: BTreeSet<Phase>,
    /// Most recent interaction, Unix seconds.
    pub last_activity: u64,
}

impl ConversationState {
    /// A zero-valued state starting at `now`.
    pub fn fresh(user_id: &str, template_id: &str, now: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            template_id: template_id.to_string(),
            start_time: now,
            interaction_count: 0,
            completed_steps: BTreeSet::new(),
            last_activity: now,
        }
    }

    /// Store key of this state.
    pub fn key(&self) -> StateKey {
        state_key(&self.user_id, &self.template_id)
    }

    /// `true` once `now - last_activity` exceeds `ttl_secs`.
    pub fn is_expired(&self, now: u64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.last_activity) > ttl_secs
    }

    /// Merge `patch` and mark the state active at `now`.
    pub fn apply(&mut self, patch: &StatePatch, now: u64) {
        self.interaction_count = self.interaction_count.saturating_add(patch.interactions);
        self.completed_steps.extend(patch.completed_steps.iter().copied());
        self.last_activity = now;
    }

    /// Completion summary for the front end.
    pub fn progress(&self) -> ConversationProgress {
        ConversationProgress::from_state(self)
    }
}

/// Fields merged into a [`ConversationState`] by an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePatch {
    /// Interactions to add to the count.
    pub interactions: u32,
    /// Phases to add to `completed_steps`.
    pub completed_steps: BTreeSet<Phase>,
}

impl StatePatch {
    /// One interaction that reached `phases`.
    pub fn interaction(phases: BTreeSet<Phase>) -> Self {
        Self {
            interactions: 1,
            completed_steps: phases,
        }
    }
}

/// Completion heuristic returned alongside answers.
///
/// `completionPercentage` counts only the essential phases
/// ([`Phase::ESSENTIAL`]); `shouldOfferCompletion` additionally requires
/// [`COMPLETION_MIN_INTERACTIONS`] interactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationProgress {
    /// Every phase reached, in a stable order.
    pub completed_steps: Vec<Phase>,
    /// Essential phases reached, as a percentage.
    pub completion_percentage: u8,
    /// `true` when the front end should offer to wrap up.
    pub should_offer_completion: bool,
    /// Interactions so far.
    pub interaction_count: u32,
}

impl ConversationProgress {
    /// Derive the summary for `state`.
    pub fn from_state(state: &ConversationState) -> Self {
        let essential_done = Phase::ESSENTIAL
            .iter()
            .filter(|p| state.completed_steps.contains(p))
            .count();
        let pct = essential_done * 100 / Phase::ESSENTIAL.len();
        let completion_percentage = u8::try_from(pct).unwrap_or(100);
        Self {
            completed_steps: state.completed_steps.iter().copied().collect(),
            completion_percentage,
            should_offer_completion: completion_percentage >= COMPLETION_MIN_PERCENTAGE
                && state.interaction_count >= COMPLETION_MIN_INTERACTIONS,
            interaction_count: state.interaction_count,
        }
    }
}

/// Injectable, expiring store of conversation states.
#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    /// Live state for the pair, or a fresh zero-valued one. Never inserts.
    async fn get(&self, user_id: &str, template_id: &str) -> ConversationState;

    /// Merge `patch` into the pair's state (creating it if needed), refresh
    /// `last_activity`, and return the result.
    async fn update(&self, user_id: &str, template_id: &str, patch: StatePatch)
        -> ConversationState;

    /// Remove expired entries; returns how many were removed.
    async fn sweep(&self) -> usize;

    /// Persist all live entries; returns how many were written.
    async fn flush(&self) -> Result<usize, SnapshotError>;

    /// Reload unexpired entries from the last flush; returns how many were
    /// loaded.
    async fn restore(&self) -> Result<usize, SnapshotError>;

    /// Number of entries currently held, expired or not.
    fn len(&self) -> usize;

    /// `true` when no entries are held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
