//! Conversation state across idle expiry, sweeps, and process restarts.

use std::sync::Arc;

use learned_response_router::classify::Phase;
use learned_response_router::clock::{ManualClock, HOUR_SECS};
use learned_response_router::config::{ConversationConfig, EngineConfig};
use learned_response_router::conversation::StatePatch;
use learned_response_router::scheduler::{ConversationSweepJob, MaintenanceJob};
use learned_response_router::{
    ConversationStateStore, MemoryConversationStore, MemoryInteractionStore, ResponseRouter,
    RouteRequest,
};

fn file_config(dir: &tempfile::TempDir) -> ConversationConfig {
    ConversationConfig {
        snapshot_path: Some(dir.path().join("conversations.json")),
        ..ConversationConfig::default()
    }
}

#[tokio::test]
async fn test_sweep_removes_entry_idle_25h_keeps_entry_idle_23h() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryConversationStore::new(
        clock.clone(),
        &ConversationConfig::default(),
    ));

    store.update("stale", "T1", StatePatch::default()).await;
    clock.advance(2 * HOUR_SECS);
    store.update("fresh", "T1", StatePatch::default()).await;
    clock.advance(23 * HOUR_SECS);

    let summary = ConversationSweepJob::new(store.clone())
        .run_once()
        .await
        .expect("sweep");
    assert_eq!(summary, "removed 1, 1 live");
    assert_eq!(store.get("stale", "T1").await.interaction_count, 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_expired_state_reads_fresh_before_any_sweep() {
    let clock = Arc::new(ManualClock::new(0));
    let store = MemoryConversationStore::new(clock.clone(), &ConversationConfig::default());
    store
        .update("u", "T1", StatePatch::interaction([Phase::Credentials].into()))
        .await;
    clock.advance(24 * HOUR_SECS + 1);

    let state = store.get("u", "T1").await;
    assert_eq!(state.interaction_count, 0);
    assert!(state.completed_steps.is_empty());
}

#[tokio::test]
async fn test_file_snapshot_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(10 * HOUR_SECS));

    let before = MemoryConversationStore::new(clock.clone(), &file_config(&dir));
    before
        .update("u", "T1", StatePatch::interaction([Phase::Credentials].into()))
        .await;
    before
        .update("u", "T1", StatePatch::interaction([Phase::Testing].into()))
        .await;
    assert_eq!(before.flush().await.expect("flush"), 1);

    clock.advance(HOUR_SECS);
    let after = MemoryConversationStore::new(clock.clone(), &file_config(&dir));
    assert_eq!(after.restore().await.expect("restore"), 1);

    let state = after.get("u", "T1").await;
    assert_eq!(state.interaction_count, 2);
    assert_eq!(state.start_time, 10 * HOUR_SECS);
    assert!(!state.progress().should_offer_completion);
    assert_eq!(state.progress().completion_percentage, 100);
}

#[tokio::test]
async fn test_restore_after_long_downtime_drops_everything() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(0));

    let before = MemoryConversationStore::new(clock.clone(), &file_config(&dir));
    before.update("u", "T1", StatePatch::default()).await;
    before.flush().await.expect("flush");

    clock.advance(48 * HOUR_SECS);
    let after = MemoryConversationStore::new(clock, &file_config(&dir));
    assert_eq!(after.restore().await.expect("restore"), 0);
    assert!(after.is_empty());
}

#[tokio::test]
async fn test_router_progress_continues_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let mut config = EngineConfig::default();
    config.conversation = file_config(&dir);

    let conversations = Arc::new(MemoryConversationStore::new(clock.clone(), &config.conversation));
    let router = ResponseRouter::new(
        &config,
        Arc::new(MemoryInteractionStore::new()),
        conversations.clone(),
        clock.clone(),
    );
    for q in ["I added the token", "how do I test it?"] {
        router
            .route(&RouteRequest::new(q, Some("T1")).with_user("u1"))
            .await
            .expect("route");
    }
    conversations.flush().await.expect("flush");

    let restarted = Arc::new(MemoryConversationStore::new(clock.clone(), &config.conversation));
    restarted.restore().await.expect("restore");
    let router = ResponseRouter::new(
        &config,
        Arc::new(MemoryInteractionStore::new()),
        restarted,
        clock,
    );
    let res = router
        .route(&RouteRequest::new("anything else?", Some("T1")).with_user("u1"))
        .await
        .expect("route");
    let progress = res.progress.expect("progress");
    assert_eq!(progress.interaction_count, 3);
    assert!(progress.should_offer_completion);
}
