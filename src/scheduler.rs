//! # Stage: Maintenance Scheduler
//!
//! ## Responsibility
//! Run periodic housekeeping beside request handling:
//! - [`ConversationSweepJob`] drops idle conversation states (hourly by default);
//! - [`PruneAndRefreshJob`] enforces interaction retention and recomputes
//!   template intelligence (every six hours by default).
//!
//! ## Guarantees
//! - Non-fatal: a failed run is logged and the loop keeps ticking.
//! - No pile-up: missed ticks are skipped, never replayed in a burst.
//! - Cooperative shutdown: every loop exits when its [`CancellationToken`]
//!   fires, even mid-wait.
//!
//! ## NOT Responsible For
//! - Flushing conversation state at shutdown (the host calls `flush`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::ConversationStateStore;
use crate::intelligence::TemplateLearner;
use crate::EngineError;

/// One unit of periodic work.
#[async_trait]
pub trait MaintenanceJob: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Perform one pass and return a one-line summary.
    async fn run_once(&self) -> Result<String, EngineError>;
}

/// Removes conversation states idle past their TTL.
pub struct ConversationSweepJob {
    store: Arc<dyn ConversationStateStore>,
}

impl ConversationSweepJob {
    /// Sweep `store`.
    pub fn new(store: Arc<dyn ConversationStateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MaintenanceJob for ConversationSweepJob {
    fn name(&self) -> &'static str {
        "conversation_sweep"
    }

    async fn run_once(&self) -> Result<String, EngineError> {
        let removed = self.store.sweep().await;
        Ok(format!("removed {removed}, {} live", self.store.len()))
    }
}

/// Prunes old interactions and refreshes template intelligence.
pub struct PruneAndRefreshJob {
    learner: TemplateLearner,
}

impl PruneAndRefreshJob {
    /// Drive `learner`.
    pub fn new(learner: TemplateLearner) -> Self {
        Self { learner }
    }
}

#[async_trait]
impl MaintenanceJob for PruneAndRefreshJob {
    fn name(&self) -> &'static str {
        "prune_and_refresh"
    }

    async fn run_once(&self) -> Result<String, EngineError> {
        let report = self.learner.prune_and_refresh().await?;
        Ok(format!(
            "pruned {}, refreshed {} templates",
            report.pruned, report.templates_refreshed
        ))
    }
}

/// Spawn a loop that runs `job` every `period` until `shutdown` fires.
///
/// The first run happens one full `period` after spawning.
pub fn spawn_job(
    job: Arc<dyn MaintenanceJob>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        info!(job = job.name(), period_secs = period.as_secs_f64(), "maintenance job started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match job.run_once().await {
                Ok(summary) => debug!(job = job.name(), %summary, "maintenance run complete"),
                Err(e) => warn!(job = job.name(), error = %e, "maintenance run failed"),
            }
        }
        info!(job = job.name(), "maintenance job stopped");
    })
}
