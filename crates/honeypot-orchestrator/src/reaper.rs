//! Shutdown reaper
//!
//! On exit signal every container carrying the orchestrator's role label is
//! force-removed, whether or not it is still tracked in the in-memory
//! registry. This is what makes a crashed orchestrator process safe to
//! restart: the next process's reaper sweep (or an operator running the
//! same label filter by hand) still finds and removes anything left behind.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::state::OrchestratorState;

/// Wait for `cancel` to fire, then force-remove every labeled container.
pub async fn run(state: Arc<OrchestratorState>, cancel: CancellationToken) {
    cancel.cancelled().await;
    tracing::info!("shutdown signal received, reaping labeled containers");

    match state.sandboxes.shutdown().await {
        Ok(()) => tracing::info!("all labeled containers reaped"),
        Err(err) => tracing::error!(error = %err, "reaping labeled containers failed"),
    }
}
