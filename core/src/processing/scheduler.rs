use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::Orchestrator;
use super::ProcessingError;
use super::RunScope;

const SCHEDULER_ACTOR: &str = "scheduler";

/// Trigger an all-league run every `interval` while inbound packets are
/// waiting. Returns when `shutdown` fires.
pub async fn run_scheduler(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so startup is quiet.
    ticker.tick().await;
    tracing::info!(interval_secs = interval.as_secs(), "processing scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if orchestrator.active_run().is_some() {
            continue;
        }
        match orchestrator.store.has_pending_inbound().await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                tracing::warn!("scheduler could not check inbound backlog: {err}");
                continue;
            }
        }
        match orchestrator.trigger(RunScope::All, SCHEDULER_ACTOR).await {
            Ok(handle) => tracing::info!(run_id = %handle.run_id, "scheduled processing run"),
            Err(ProcessingError::AlreadyRunning { .. }) => {}
            Err(err) => tracing::warn!("scheduled processing run not started: {err}"),
        }
    }
    tracing::info!("processing scheduler stopped");
}
