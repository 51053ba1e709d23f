//! Demo binary for learned-response-router
//!
//! Routes a scripted setup conversation through the tier pipeline, records
//! feedback, and shows a repeated question being served from the learned
//! cache on its third ask.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)
//! - `ROUTER_CONFIG=path.toml` — configuration file (default: built-in)
//! - `OPENAI_API_KEY` — enables the real external tier; without it a canned
//!   local model stands in so the learning loop is still visible

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use learned_response_router::clock::SystemClock;
use learned_response_router::config::{loader, EngineConfig};
use learned_response_router::external::{ChatPrompt, ExternalCallError};
use learned_response_router::scheduler::{spawn_job, ConversationSweepJob, PruneAndRefreshJob};
use learned_response_router::{
    init_tracing, metrics, AnswerModel, ConversationStateStore, ExternalAnswerClient, FeedbackKind,
    FeedbackRequest, MemoryConversationStore, MemoryInteractionStore, ResponseRouter, RouteRequest,
    Turn,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Offline stand-in for the external model.
struct CannedModel;

#[async_trait]
impl AnswerModel for CannedModel {
    async fn complete(&self, prompt: &ChatPrompt) -> Result<String, ExternalCallError> {
        let question = prompt
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!(
            "Here is how to handle \"{question}\": open the node, check each highlighted field, then click Execute step."
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured tracing (JSON or pretty, based on LOG_FORMAT env)
    let _ = init_tracing();

    // Initialize Prometheus metrics registry before any request is routed.
    metrics::init_metrics()?;

    let config = match std::env::var_os("ROUTER_CONFIG") {
        Some(path) => loader::load_from_file(&PathBuf::from(path))?,
        None => EngineConfig::default(),
    };
    info!("Starting learned-response-router demo");

    let shutdown = CancellationToken::new();
    let clock = Arc::new(SystemClock);
    let interactions = Arc::new(MemoryInteractionStore::new());
    let conversations = Arc::new(MemoryConversationStore::new(
        clock.clone(),
        &config.conversation,
    ));
    if let Err(e) = conversations.restore().await {
        warn!(error = %e, "could not restore conversation snapshot, starting empty");
    }

    let mut router = ResponseRouter::new(&config, interactions, conversations.clone(), clock)
        .with_openai_from_env(&config.external, shutdown.clone());
    if !router.has_external() {
        info!("using canned local model for the external tier");
        router = router.with_external(ExternalAnswerClient::new(
            Arc::new(CannedModel),
            config.external.timeout(),
            shutdown.clone(),
        ));
    }

    let jobs = vec![
        spawn_job(
            Arc::new(ConversationSweepJob::new(conversations.clone())),
            config.conversation.sweep_interval(),
            shutdown.clone(),
        ),
        spawn_job(
            Arc::new(PruneAndRefreshJob::new(router.learner().clone())),
            config.retention.prune_interval(),
            shutdown.clone(),
        ),
    ];

    // A scripted conversation for one user on one template.
    let mut history: Vec<Turn> = Vec::new();
    let script = [
        "How do I add OpenAI credentials?",
        "What does the Slack node do in this workflow?",
        "What prompt runs this chat?",
        r#"{"name": "Digest", "nodes": [{"type": "slack"}], "connections": {}}"#,
        "I added the token, how do I test it?",
    ];
    for question in script {
        let req = RouteRequest::new(question, Some("slack-digest"))
            .with_user("demo-user")
            .with_history(history.clone());
        let (state, res) = router.route_with_state(&req).await?;
        info!(
            state = %state,
            source = %res.source,
            confidence = res.confidence,
            progress = ?res.progress.as_ref().map(|p| p.completion_percentage),
            "answered"
        );
        history.push(Turn::user(question));
        history.push(Turn::assistant(res.answer));
    }

    // The same question asked three times; helpful feedback promotes it.
    let repeated = "How do I change the schedule?";
    for ask in 1..=3 {
        let req = RouteRequest::new(repeated, Some("slack-digest")).with_user("demo-user");
        let (state, res) = router.route_with_state(&req).await?;
        info!(ask, state = %state, source = %res.source, "repeated question answered");
        if let Some(id) = res.interaction_id {
            router
                .record_feedback(&FeedbackRequest::new(id, FeedbackKind::Helpful))
                .await?;
        }
    }

    // Graceful shutdown: stop maintenance, then persist conversations.
    shutdown.cancel();
    for job in jobs {
        let _ = job.await;
    }
    match conversations.flush().await {
        Ok(count) => info!(count, "conversation states persisted"),
        Err(e) => warn!(error = %e, "conversation flush failed"),
    }

    let summary = metrics::get_metrics_summary();
    info!(
        responses = ?summary.responses_total,
        external_calls = ?summary.external_calls_total,
        avoided = summary.external_calls_avoided,
        "demo complete"
    );
    println!("{}", metrics::gather_metrics());
    Ok(())
}
