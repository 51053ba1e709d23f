//! In-process conversation store backed by a [`DashMap`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::snapshot::{
    ConversationSnapshot, JsonFileSnapshot, NoSnapshot, SnapshotError, StateSnapshotStore,
};
use super::{state_key, ConversationState, ConversationStateStore, StateKey, StatePatch};
use crate::clock::Clock;
use crate::config::ConversationConfig;
use crate::metrics;

/// Bounded, expiring conversation map.
///
/// ```rust
/// use std::sync::Arc;
/// use learned_response_router::clock::ManualClock;
/// use learned_response_router::config::ConversationConfig;
/// use learned_response_router::conversation::{ConversationStateStore, StatePatch};
/// use learned_response_router::MemoryConversationStore;
/// # #[tokio::main]
/// # async fn main() {
/// let clock = Arc::new(ManualClock::new(0));
/// let store = MemoryConversationStore::new(clock, &ConversationConfig::default());
/// let state = store.update("alice", "T1", StatePatch::default()).await;
/// assert_eq!(state.user_id, "alice");
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryConversationStore {
    entries: DashMap<StateKey, ConversationState>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    max_entries: usize,
    snapshot: Arc<dyn StateSnapshotStore>,
}

impl MemoryConversationStore {
    /// Store configured from the `[conversation]` section. A configured
    /// `snapshot_path` enables [`JsonFileSnapshot`] persistence.
    pub fn new(clock: Arc<dyn Clock>, config: &ConversationConfig) -> Self {
        let snapshot: Arc<dyn StateSnapshotStore> = match &config.snapshot_path {
            Some(path) => Arc::new(JsonFileSnapshot::new(path)),
            None => Arc::new(NoSnapshot),
        };
        Self {
            entries: DashMap::new(),
            clock,
            ttl_secs: config.ttl_secs(),
            max_entries: config.max_entries,
            snapshot,
        }
    }

    /// Replace the snapshot backend.
    pub fn with_snapshot(mut self, snapshot: Arc<dyn StateSnapshotStore>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Evict least recently active entries until there is room for one more.
    fn make_room(&self) {
        while self.max_entries > 0 && self.entries.len() >= self.max_entries {
            // Collect the key first so no shard guard is held during remove.
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_activity)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    debug!(
                        user_id = %key.0,
                        template_id = %key.1,
                        "evicted least recently active conversation"
                    );
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl ConversationStateStore for MemoryConversationStore {
    async fn get(&self, user_id: &str, template_id: &str) -> ConversationState {
        let now = self.clock.now_secs();
        self.entries
            .get(&state_key(user_id, template_id))
            .map(|e| e.value().clone())
            .filter(|s| !s.is_expired(now, self.ttl_secs))
            .unwrap_or_else(|| ConversationState::fresh(user_id, template_id, now))
    }

    async fn update(
        &self,
        user_id: &str,
        template_id: &str,
        patch: StatePatch,
    ) -> ConversationState {
        let now = self.clock.now_secs();
        let key = state_key(user_id, template_id);
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        let state = {
            let mut entry = self
                .entries
                .entry(key)
                .or_insert_with(|| ConversationState::fresh(user_id, template_id, now));
            if entry.is_expired(now, self.ttl_secs) {
                *entry = ConversationState::fresh(user_id, template_id, now);
            }
            entry.apply(&patch, now);
            entry.clone()
        };
        metrics::set_conversation_states(self.entries.len());
        state
    }

    async fn sweep(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.entries.len();
        self.entries.retain(|_, s| !s.is_expired(now, self.ttl_secs));
        let after = self.entries.len();
        metrics::set_conversation_states(after);
        before.saturating_sub(after)
    }

    async fn flush(&self) -> Result<usize, SnapshotError> {
        let now = self.clock.now_secs();
        let entries: Vec<ConversationState> = self
            .entries
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| !s.is_expired(now, self.ttl_secs))
            .collect();
        let count = entries.len();
        self.snapshot.save(&ConversationSnapshot::now(entries)).await?;
        info!(count, "conversation states flushed");
        Ok(count)
    }

    async fn restore(&self) -> Result<usize, SnapshotError> {
        let Some(snapshot) = self.snapshot.load().await? else {
            return Ok(0);
        };
        let now = self.clock.now_secs();
        let total = snapshot.entries.len();
        let mut loaded = 0;
        for state in snapshot.entries {
            if state.is_expired(now, self.ttl_secs) {
                continue;
            }
            let key = state.key();
            if !self.entries.contains_key(&key) {
                self.make_room();
            }
            self.entries.insert(key, state);
            loaded += 1;
        }
        metrics::set_conversation_states(self.entries.len());
        info!(
            loaded,
            dropped = total - loaded,
            saved_at = %snapshot.saved_at,
            "conversation states restored"
        );
        Ok(loaded)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Phase;
    use crate::clock::{ManualClock, HOUR_SECS};
    use crate::conversation::MemorySnapshot;

    fn store_with(clock: Arc<ManualClock>, max_entries: usize) -> MemoryConversationStore {
        let config = ConversationConfig {
            max_entries,
            ..ConversationConfig::default()
        };
        MemoryConversationStore::new(clock, &config)
    }

    #[tokio::test]
    async fn test_get_returns_fresh_state_without_inserting() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = store_with(clock, 10);
        let s = store.get("u", "T1").await;
        assert_eq!(s.interaction_count, 0);
        assert_eq!(s.start_time, 1_000);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_and_refreshes_activity() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = store_with(clock.clone(), 10);
        store
            .update("u", "T1", StatePatch::interaction([Phase::Credentials].into()))
            .await;
        clock.advance(60);
        let s = store
            .update("u", "T1", StatePatch::interaction([Phase::Testing].into()))
            .await;
        assert_eq!(s.interaction_count, 2);
        assert_eq!(s.start_time, 1_000);
        assert_eq!(s.last_activity, 1_060);
        assert_eq!(store.get("u", "T1").await, s);
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(clock, 10);
        store.update("u", "T1", StatePatch::interaction([].into())).await;
        store.update("u", "T2", StatePatch::interaction([].into())).await;
        store.update("v", "T1", StatePatch::interaction([].into())).await;
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_ids_containing_colons_do_not_share_state() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(clock, 10);
        store
            .update("a:b", "c", StatePatch::interaction([Phase::Credentials].into()))
            .await;

        let other = store.get("a", "b:c").await;
        assert_eq!(other.interaction_count, 0);
        assert!(other.completed_steps.is_empty());
        assert_eq!(other.user_id, "a");

        store.update("a", "b:c", StatePatch::interaction([].into())).await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a:b", "c").await.interaction_count, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_restarts_on_update() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(clock.clone(), 10);
        store.update("u", "T1", StatePatch::interaction([].into())).await;
        clock.advance(25 * HOUR_SECS);
        assert_eq!(store.get("u", "T1").await.interaction_count, 0);
        let s = store.update("u", "T1", StatePatch::interaction([].into())).await;
        assert_eq!(s.interaction_count, 1);
        assert_eq!(s.start_time, 25 * HOUR_SECS);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(clock.clone(), 10);
        store.update("old", "T", StatePatch::default()).await;
        clock.advance(2 * HOUR_SECS);
        store.update("new", "T", StatePatch::default()).await;
        clock.advance(23 * HOUR_SECS);
        assert_eq!(store.sweep().await, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_full_store_evicts_least_recently_active() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(clock.clone(), 2);
        store.update("a", "T", StatePatch::default()).await;
        clock.advance(1);
        store.update("b", "T", StatePatch::default()).await;
        clock.advance(1);
        store.update("a", "T", StatePatch::default()).await;
        clock.advance(1);
        store.update("c", "T", StatePatch::default()).await;
        assert_eq!(store.len(), 2);
        assert!(!store.entries.contains_key(&state_key("b", "T")));
        assert!(store.entries.contains_key(&state_key("a", "T")));
        assert!(store.entries.contains_key(&state_key("c", "T")));
    }

    #[tokio::test]
    async fn test_flush_then_restore_drops_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let snapshot = Arc::new(MemorySnapshot::new());
        let store = store_with(clock.clone(), 10).with_snapshot(snapshot.clone());
        store.update("old", "T", StatePatch::default()).await;
        clock.advance(10 * HOUR_SECS);
        store.update("new", "T", StatePatch::default()).await;
        assert_eq!(store.flush().await.expect("flush"), 2);

        clock.advance(20 * HOUR_SECS);
        let restarted = store_with(clock, 10).with_snapshot(snapshot);
        assert_eq!(restarted.restore().await.expect("restore"), 1);
        assert_eq!(restarted.get("new", "T").await.last_activity, 10 * HOUR_SECS);
        assert_eq!(restarted.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_is_empty() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_with(clock, 10);
        assert_eq!(store.restore().await.expect("restore"), 0);
    }
}
