//! Event Logger
//!
//! Persists session-scoped events to Postgres. A logging session borrows a
//! single connection from the pool on its first insert and runs every
//! subsequent insert in that connection's transaction; `end()` commits and
//! returns the connection, `abort()` rolls back. A [`LoggingSession`]
//! dropped while still running is a bug and is logged at `error` level -
//! the attacker session itself is never torn down because of it, per the
//! "honeypot value is non-zero without logs" tradeoff.

mod events;
mod session;

pub use events::Event;
pub use session::LoggingSession;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use honeypot_core::config::BackoffConfig;
use honeypot_core::ExponentialBackoff;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("logging session was not started")]
    NotStarted,
    #[error("logging session has already ended")]
    AlreadyEnded,
    #[error("could not acquire a database connection before the deadline")]
    AcquireTimedOut,
}

/// Shared handle to the event store; one instance per process.
pub struct EventLogger {
    pool: PgPool,
    backoff: BackoffConfig,
    acquire_deadline: Duration,
}

impl EventLogger {
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
        backoff: BackoffConfig,
        acquire_deadline: Duration,
    ) -> Result<Self, LoggerError> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool,
            backoff,
            acquire_deadline,
        })
    }

    /// Begin a new logging session for one accepted attacker connection.
    /// Retries connection acquisition with exponential backoff up to
    /// `acquire_deadline`; on timeout the session is never created and the
    /// caller is expected to continue the attacker session without logging.
    /// The same backoff/deadline also governs the session's later per-event
    /// retries (§"Logger storage" treats acquisition and steady-state
    /// inserts as the same transient-failure budget).
    pub async fn begin(
        &self,
        src_address: IpAddr,
        src_port: u16,
        dst_address: IpAddr,
        dst_port: u16,
        ssh_version: &str,
    ) -> Result<Arc<LoggingSession>, LoggerError> {
        let deadline = Instant::now() + self.acquire_deadline;
        let mut backoff = ExponentialBackoff::from_config(&self.backoff);

        let mut tx = loop {
            match self.pool.begin().await {
                Ok(tx) => break tx,
                Err(e) if Instant::now() >= deadline => {
                    tracing::error!(error = %e, "giving up acquiring a logger connection");
                    return Err(LoggerError::AcquireTimedOut);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, "logger connection acquisition failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        sqlx::query("INSERT INTO network_source (ip_address) VALUES ($1) ON CONFLICT (ip_address) DO NOTHING")
            .bind(src_address.to_string())
            .execute(&mut *tx)
            .await?;

        let session_id: i32 = sqlx::query_scalar(
            r#"INSERT INTO session (attack_src, protocol, src_port, dst_ip, dst_port)
               VALUES ($1, 'ssh', $2, $3, $4)
               RETURNING id"#,
        )
        .bind(src_address.to_string())
        .bind(src_port as i32)
        .bind(dst_address.to_string())
        .bind(dst_port as i32)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO ssh_session (session_id, version) VALUES ($1, $2)")
            .bind(session_id)
            .bind(ssh_version)
            .execute(&mut *tx)
            .await?;

        Ok(Arc::new(LoggingSession::new(
            session_id,
            tx,
            self.backoff.clone(),
            self.acquire_deadline,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_error_display_is_stable() {
        assert_eq!(LoggerError::NotStarted.to_string(), "logging session was not started");
    }
}
