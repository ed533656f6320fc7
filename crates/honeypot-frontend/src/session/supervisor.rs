//! Transport supervisor
//!
//! Periodically sweeps the session registry for attacker sessions that have
//! gone idle (no open channels, no activity within `SSH_SESSION_TIMEOUT`)
//! and tears them down: yields the assigned target system back to the
//! orchestrator and removes the session from the registry. Uses the same
//! CAS-based `try_close()` pattern the teacher's orphan-cleanup task uses,
//! so a session being closed by its own transport task can never race with
//! the supervisor closing it out from under it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use honeypot_core::time::current_time_millis;

use crate::provider::ProviderClient;
use crate::session::manager::SessionManager;

/// How often the supervisor wakes up to check for idle sessions.
const SWEEP_INTERVAL: Duration = Duration::from_millis(300);

/// Run the transport supervisor until cancelled.
pub async fn run(
    sessions: Arc<SessionManager>,
    provider: Arc<ProviderClient>,
    session_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);

    tracing::info!(
        sweep_interval_ms = SWEEP_INTERVAL.as_millis() as u64,
        session_timeout_s = session_timeout.as_secs(),
        "transport supervisor starting"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep_idle_sessions(&sessions, &provider, session_timeout).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("transport supervisor shutting down");
                break;
            }
        }
    }
}

async fn sweep_idle_sessions(
    sessions: &Arc<SessionManager>,
    provider: &Arc<ProviderClient>,
    session_timeout: Duration,
) {
    let now = current_time_millis();
    let cutoff = now.saturating_sub(session_timeout.as_millis() as u64);

    for session in sessions.list() {
        if session.open_channel_count() > 0 {
            continue;
        }
        if session.last_activity_millis() >= cutoff {
            continue;
        }
        if !session.try_close() {
            continue; // another path (the transport's own teardown) won the race
        }

        tracing::info!(session_id = %session.id, peer = %session.peer_addr, "reaping idle session");

        // The proxy handler that actually owns this target system lives on
        // the connection task, not here; reaping yields it directly rather
        // than forcing that task to wake up and notice the session died.
        if let Some(target) = session.target_system() {
            if let Err(e) = provider.yield_target_system(target.id).await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to yield target system during reap");
            }
        }

        if let Some(logger) = session.logger_session() {
            if let Err(e) = logger.end().await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to end logging session during reap");
            }
        }

        sessions.remove(session.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_interval_is_sub_second() {
        assert!(SWEEP_INTERVAL < Duration::from_secs(1));
    }
}
