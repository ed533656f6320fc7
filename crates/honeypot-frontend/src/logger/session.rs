use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Postgres, Transaction};
use tokio::sync::Mutex;

use honeypot_core::config::BackoffConfig;
use honeypot_core::ExponentialBackoff;

use super::{Event, LoggerError};

enum State {
    Running(Transaction<'static, Postgres>),
    Ended,
    Aborted,
}

/// One attacker connection's logging session. Serializes inserts behind an
/// async mutex so the state machine task, pump tasks, and the supervisor can
/// all hold the same `Arc<LoggingSession>` and call into it concurrently.
pub struct LoggingSession {
    session_id: i32,
    state: Mutex<State>,
    backoff: BackoffConfig,
    retry_deadline: Duration,
}

impl LoggingSession {
    pub(super) fn new(
        session_id: i32,
        tx: Transaction<'static, Postgres>,
        backoff: BackoffConfig,
        retry_deadline: Duration,
    ) -> Self {
        Self {
            session_id,
            state: Mutex::new(State::Running(tx)),
            backoff,
            retry_deadline,
        }
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Persist one event plus its per-type row, in the session's
    /// transaction, timestamped when this call was made rather than when
    /// the wrapping transaction commits. A transient failure retries with
    /// exponential backoff up to `retry_deadline`; exhausting it aborts the
    /// session and logs critically. A logging failure here never propagates
    /// to the caller as a reason to tear down the attacker session.
    pub async fn log_event(&self, event: Event) -> Result<(), LoggerError> {
        let occurred_at = Utc::now();
        let deadline = Instant::now() + self.retry_deadline;
        let mut backoff = ExponentialBackoff::from_config(&self.backoff);

        loop {
            match self.insert_event(event.clone(), occurred_at).await {
                Ok(()) => return Ok(()),
                Err(e @ (LoggerError::AlreadyEnded | LoggerError::NotStarted)) => return Err(e),
                Err(e) if Instant::now() >= deadline => {
                    tracing::error!(
                        error = %e,
                        session_id = self.session_id,
                        "event insert retries exhausted, aborting logging session"
                    );
                    self.abort().await;
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, session_id = self.session_id, "event insert failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn insert_event(&self, event: Event, occurred_at: DateTime<Utc>) -> Result<(), LoggerError> {
        let mut guard = self.state.lock().await;
        let tx = match &mut *guard {
            State::Running(tx) => tx,
            State::Ended => return Err(LoggerError::AlreadyEnded),
            State::Aborted => return Err(LoggerError::NotStarted),
        };

        let event_id: i32 = sqlx::query_scalar(
            "INSERT INTO event (session_id, session_protocol, type, timestamp) VALUES ($1, 'ssh', $2, $3) RETURNING id",
        )
        .bind(self.session_id)
        .bind(event.kind())
        .bind(occurred_at)
        .fetch_one(&mut **tx)
        .await?;

        match event {
            Event::LoginAttempt { username, password } => {
                sqlx::query("INSERT INTO login_attempt (event_id, username, password) VALUES ($1, $2, $3)")
                    .bind(event_id)
                    .bind(username)
                    .bind(password)
                    .execute(&mut **tx)
                    .await?;
            }
            Event::PtyRequest {
                channel,
                term,
                cols,
                rows,
                px_width,
                px_height,
            } => {
                sqlx::query(
                    r#"INSERT INTO pty_request
                       (event_id, event_type, session_protocol, channel_id, term, term_width_cols,
                        term_height_rows, term_width_pixels, term_height_pixels)
                       VALUES ($1, 'pty_request', 'ssh', $2, $3, $4, $5, $6, $7)"#,
                )
                .bind(event_id)
                .bind(channel as i32)
                .bind(term)
                .bind(cols as i32)
                .bind(rows as i32)
                .bind(px_width as i32)
                .bind(px_height as i32)
                .execute(&mut **tx)
                .await?;
            }
            Event::EnvRequest { channel, name, value } => {
                sqlx::query(
                    r#"INSERT INTO env_request (event_id, event_type, session_protocol, channel_id, name, value)
                       VALUES ($1, 'env_request', 'ssh', $2, $3, $4)"#,
                )
                .bind(event_id)
                .bind(channel as i32)
                .bind(name)
                .bind(value)
                .execute(&mut **tx)
                .await?;
            }
            Event::DirectTcpipRequest {
                channel,
                origin_ip,
                origin_port,
                destination,
                destination_port,
            } => {
                sqlx::query(
                    r#"INSERT INTO direct_tcpip_request
                       (event_id, event_type, session_protocol, channel_id, origin_ip, origin_port,
                        destination, destination_port)
                       VALUES ($1, 'direct_tcpip_request', 'ssh', $2, $3, $4, $5, $6)"#,
                )
                .bind(event_id)
                .bind(channel as i32)
                .bind(origin_ip.to_string())
                .bind(origin_port as i32)
                .bind(destination)
                .bind(destination_port as i32)
                .execute(&mut **tx)
                .await?;
            }
            Event::X11Request {
                channel,
                single_connection,
                auth_protocol,
                auth_cookie,
                screen_number,
            } => {
                sqlx::query(
                    r#"INSERT INTO x_eleven_request
                       (event_id, event_type, session_protocol, channel_id, single_connection,
                        auth_protocol, auth_cookie, screen_number)
                       VALUES ($1, 'x_eleven_request', 'ssh', $2, $3, $4, $5, $6)"#,
                )
                .bind(event_id)
                .bind(channel as i32)
                .bind(single_connection)
                .bind(auth_protocol)
                .bind(auth_cookie)
                .bind(screen_number as i32)
                .execute(&mut **tx)
                .await?;
            }
            Event::PortForwardRequest { address, port } => {
                sqlx::query(
                    r#"INSERT INTO port_forward_request (event_id, event_type, session_protocol, address, port)
                       VALUES ($1, 'port_forward_request', 'ssh', $2, $3)"#,
                )
                .bind(event_id)
                .bind(address)
                .bind(port as i32)
                .execute(&mut **tx)
                .await?;
            }
            Event::Command { input } => {
                sqlx::query("INSERT INTO command (event_id, input) VALUES ($1, $2)")
                    .bind(event_id)
                    .bind(input)
                    .execute(&mut **tx)
                    .await?;
            }
            Event::ChannelOutput { channel, data } => {
                sqlx::query("INSERT INTO ssh_channel_output (event_id, data, channel) VALUES ($1, $2, $3)")
                    .bind(event_id)
                    .bind(data)
                    .bind(channel as i32)
                    .execute(&mut **tx)
                    .await?;
            }
            Event::Download {
                data,
                mime_type,
                source_address,
                source_url,
                save_data,
            } => {
                let hash = Sha256::digest(&data).to_vec();

                if save_data {
                    sqlx::query(
                        r#"INSERT INTO file (hash, data, type) VALUES ($1, $2, $3)
                           ON CONFLICT (hash) DO UPDATE SET data = EXCLUDED.data"#,
                    )
                    .bind(&hash)
                    .bind(&data)
                    .bind(&mime_type)
                    .execute(&mut **tx)
                    .await?;
                } else {
                    sqlx::query("INSERT INTO file (hash, data, type) VALUES ($1, NULL, $2) ON CONFLICT (hash) DO NOTHING")
                        .bind(&hash)
                        .bind(&mime_type)
                        .execute(&mut **tx)
                        .await?;
                }

                sqlx::query("INSERT INTO network_source (ip_address) VALUES ($1) ON CONFLICT (ip_address) DO NOTHING")
                    .bind(source_address.to_string())
                    .execute(&mut **tx)
                    .await?;

                sqlx::query("INSERT INTO download (event_id, hash, src, url) VALUES ($1, $2, $3, $4)")
                    .bind(event_id)
                    .bind(&hash)
                    .bind(source_address.to_string())
                    .bind(source_url)
                    .execute(&mut **tx)
                    .await?;
            }
        }

        Ok(())
    }

    /// Commit the session's transaction and mark `session.end_timestamp`.
    pub async fn end(&self) -> Result<(), LoggerError> {
        let mut guard = self.state.lock().await;
        match std::mem::replace(&mut *guard, State::Ended) {
            State::Running(mut tx) => {
                sqlx::query("UPDATE session SET end_timestamp = now() WHERE id = $1")
                    .bind(self.session_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            State::Ended => Err(LoggerError::AlreadyEnded),
            State::Aborted => Err(LoggerError::NotStarted),
        }
    }

    /// Roll back whatever was logged so far. Used when connection
    /// acquisition or an insert fails past the point of no return.
    pub async fn abort(&self) {
        let mut guard = self.state.lock().await;
        if let State::Running(tx) = std::mem::replace(&mut *guard, State::Aborted) {
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, session_id = self.session_id, "error rolling back aborted logging session");
            }
        }
    }
}

impl Drop for LoggingSession {
    fn drop(&mut self) {
        if let Ok(guard) = self.state.try_lock() {
            if matches!(*guard, State::Running(_)) {
                tracing::error!(session_id = self.session_id, "logging session dropped while still running - data lost");
            }
        }
    }
}
