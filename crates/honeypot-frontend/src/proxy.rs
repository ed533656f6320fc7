//! Proxy Handler
//!
//! Bridges one attacker SSH session to the sandbox acquired for it: opens an
//! outbound SSH client to the target, mirrors every attacker channel onto a
//! peer sandbox channel, and logs commands and channel output along the way.
//! Owned exclusively by the per-connection SSH state machine task; channel
//! bookkeeping here is plain `HashMap`, not `DashMap`, because nothing but
//! that task ever mutates it - the pump each channel spawns only reads the
//! one channel handle it was given at spawn time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::server;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Msg};
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::sync::mpsc;

use honeypot_protocol::SourceAddress;

use crate::command_parser::CommandParser;
use crate::logger::{Event, LoggingSession};
use crate::provider::{AcquiredTargetSystem, ProviderClient, ProviderError};

/// Retries for the outbound sandbox SSH connection, per attempt.
const SANDBOX_CONNECT_RETRIES: u32 = 10;
/// Base delay for the `2^i * base_ms` backoff between sandbox connect attempts.
const SANDBOX_CONNECT_BASE_MS: u64 = 200;
/// Channel capacity for attacker->sandbox bytes queued to a pump task.
const PUMP_INPUT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no sandbox is currently available")]
    Unavailable,
    #[error("sandbox rejected the attacker's credentials")]
    AuthenticationFailed,
    #[error("failed to connect to the sandbox: {0}")]
    ConnectFailed(#[source] anyhow::Error),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Bridges one attacker SSH session to its acquired sandbox.
pub struct ProxyHandler {
    provider: Arc<ProviderClient>,
    logger: Option<Arc<LoggingSession>>,
    target: AcquiredTargetSystem,
    sandbox: client::Handle<SandboxHandler>,
    /// Sandbox-side channels that have been opened but not yet handed a
    /// shell/exec request; removed (and moved into a pump task) once one is.
    pending_channels: HashMap<ChannelId, Channel<Msg>>,
    /// Attacker->sandbox byte queues for channels whose pump is running.
    pump_inputs: HashMap<ChannelId, mpsc::Sender<Vec<u8>>>,
    /// Small integer ids for logging, independent of the wire `ChannelId`.
    local_channel_ids: HashMap<ChannelId, u32>,
    next_local_channel_id: u32,
    yielded: Arc<AtomicBool>,
}

impl ProxyHandler {
    /// Acquire a sandbox from the provider and open an SSH client to it,
    /// using the attacker's captured credentials for both. On any failure
    /// past acquisition the sandbox is yielded back before returning.
    pub async fn acquire(
        provider: Arc<ProviderClient>,
        logger: Option<Arc<LoggingSession>>,
        user: String,
        password: String,
    ) -> Result<Self, ProxyError> {
        let target = match provider.acquire_target_system(user.clone(), password.clone()).await {
            Ok(target) => target,
            Err(ProviderError::Unavailable) => return Err(ProxyError::Unavailable),
            Err(e) => return Err(ProxyError::Provider(e)),
        };

        match connect_to_sandbox(&target, &user, &password).await {
            Ok(sandbox) => Ok(Self {
                provider,
                logger,
                target,
                sandbox,
                pending_channels: HashMap::new(),
                pump_inputs: HashMap::new(),
                local_channel_ids: HashMap::new(),
                next_local_channel_id: 0,
                yielded: Arc::new(AtomicBool::new(false)),
            }),
            Err(e) => {
                if let Err(yield_err) = provider.yield_target_system(target.id).await {
                    tracing::warn!(error = %yield_err, target = %target.id, "failed to yield target system after failed sandbox connect");
                }
                Err(e)
            }
        }
    }

    pub fn target_id(&self) -> honeypot_core::types::TargetSystemId {
        self.target.id
    }

    pub fn target(&self) -> &AcquiredTargetSystem {
        &self.target
    }

    /// Open a peer sandbox channel for a freshly opened attacker channel.
    pub async fn open_channel(&mut self, attacker_channel: ChannelId) -> Result<(), ProxyError> {
        let channel = self
            .sandbox
            .channel_open_session()
            .await
            .map_err(|e| ProxyError::ConnectFailed(e.into()))?;

        let local_id = self.next_local_channel_id;
        self.next_local_channel_id += 1;
        self.local_channel_ids.insert(attacker_channel, local_id);
        self.pending_channels.insert(attacker_channel, channel);
        Ok(())
    }

    pub async fn handle_pty_request(
        &mut self,
        attacker_channel: ChannelId,
        term: &str,
        cols: u32,
        rows: u32,
        px_width: u32,
        px_height: u32,
    ) -> bool {
        let Some(channel) = self.pending_channels.get(&attacker_channel) else {
            return false;
        };
        let ok = channel
            .request_pty(false, term, cols, rows, px_width, px_height, &[])
            .await
            .is_ok();

        if let Some(logger) = &self.logger {
            let local_id = *self.local_channel_ids.get(&attacker_channel).unwrap_or(&0);
            let _ = logger
                .log_event(Event::PtyRequest {
                    channel: local_id,
                    term: term.to_string(),
                    cols,
                    rows,
                    px_width,
                    px_height,
                })
                .await;
        }

        ok
    }

    pub async fn handle_window_change_request(
        &mut self,
        attacker_channel: ChannelId,
        cols: u32,
        rows: u32,
        px_width: u32,
        px_height: u32,
    ) -> bool {
        let Some(channel) = self.pending_channels.get(&attacker_channel) else {
            return false;
        };
        channel.window_change(cols, rows, px_width, px_height).await.is_ok()
    }

    /// Small integer id logged for `attacker_channel`, or 0 if it was never
    /// assigned one (the channel request arrived before `channel_open_session`).
    pub fn local_channel_id(&self, attacker_channel: ChannelId) -> u32 {
        *self.local_channel_ids.get(&attacker_channel).unwrap_or(&0)
    }

    /// Record an `env` request for the attacker's channel. The sandbox
    /// itself never receives these: the reference honeypot logs them purely
    /// as attacker fingerprinting signal.
    pub async fn log_env_request(&self, attacker_channel: ChannelId, name: &str, value: &str) {
        let Some(logger) = &self.logger else { return };
        let local_id = *self.local_channel_ids.get(&attacker_channel).unwrap_or(&0);
        let _ = logger
            .log_event(Event::EnvRequest {
                channel: local_id,
                name: name.to_string(),
                value: value.to_string(),
            })
            .await;
    }

    pub async fn handle_shell_request(
        &mut self,
        attacker_channel: ChannelId,
        attacker_handle: server::Handle,
    ) -> bool {
        let Some(channel) = self.pending_channels.remove(&attacker_channel) else {
            return false;
        };
        if channel.request_shell(true).await.is_err() {
            return false;
        }
        self.spawn_pump(attacker_channel, channel, attacker_handle);
        true
    }

    pub async fn handle_exec_request(
        &mut self,
        attacker_channel: ChannelId,
        attacker_handle: server::Handle,
        command: &str,
    ) -> bool {
        let Some(channel) = self.pending_channels.remove(&attacker_channel) else {
            return false;
        };
        if channel.exec(true, command).await.is_err() {
            return false;
        }

        if let Some(logger) = &self.logger {
            let logger = Arc::clone(logger);
            let local_id = *self.local_channel_ids.get(&attacker_channel).unwrap_or(&0);
            let command = command.to_string();
            tokio::spawn(async move {
                let _ = logger.log_event(Event::Command { input: command.clone() }).await;
                let _ = logger
                    .log_event(Event::ChannelOutput {
                        channel: local_id,
                        data: command.into_bytes(),
                    })
                    .await;
            });
        }

        self.spawn_pump(attacker_channel, channel, attacker_handle);
        true
    }

    /// Forward attacker bytes to the peer sandbox channel's pump task.
    pub async fn forward_attacker_data(&self, attacker_channel: ChannelId, data: &[u8]) {
        if let Some(tx) = self.pump_inputs.get(&attacker_channel) {
            if tx.send(data.to_vec()).await.is_err() {
                tracing::debug!(?attacker_channel, "pump task gone, dropping attacker bytes");
            }
        }
    }

    /// Signal the pump (if any) that the attacker closed this channel.
    pub fn close_channel(&mut self, attacker_channel: ChannelId) {
        self.pending_channels.remove(&attacker_channel);
        self.pump_inputs.remove(&attacker_channel);
        self.local_channel_ids.remove(&attacker_channel);
    }

    fn spawn_pump(
        &mut self,
        attacker_channel: ChannelId,
        sandbox_channel: Channel<Msg>,
        attacker_handle: server::Handle,
    ) {
        let (tx, rx) = mpsc::channel(PUMP_INPUT_CAPACITY);
        self.pump_inputs.insert(attacker_channel, tx);
        let local_id = *self.local_channel_ids.get(&attacker_channel).unwrap_or(&0);
        let logger = self.logger.clone();
        tokio::spawn(pump(attacker_channel, local_id, sandbox_channel, attacker_handle, rx, logger));
    }

    /// Yield the sandbox back to the provider exactly once, replaying the
    /// reconstructed network-capture events through the logger.
    pub async fn close(&mut self) {
        if self.yielded.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.provider.yield_target_system(self.target.id).await {
            Ok(events) => {
                let Some(logger) = &self.logger else { return };
                for event in events {
                    let source_address = match event.source_address {
                        SourceAddress::V4(addr) => IpAddr::V4(addr),
                        SourceAddress::V6(addr) => IpAddr::V6(addr),
                    };
                    if let Err(e) = logger
                        .log_event(Event::Download {
                            data: event.data,
                            mime_type: event.mime_type,
                            source_address,
                            source_url: event.url,
                            save_data: true,
                        })
                        .await
                    {
                        tracing::warn!(error = %e, "failed to log reconstructed download event");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, target = %self.target.id, "failed to yield target system");
            }
        }
    }
}

/// One logical task per established channel pair: drains attacker bytes
/// queued by the owning state machine into the sandbox channel, and relays
/// whatever the sandbox channel produces back to the attacker. Async
/// `select!` plays the role the reference implementation's bounded poll
/// loop plays, without needing an explicit timeout on either branch.
async fn pump(
    attacker_channel: ChannelId,
    local_id: u32,
    mut sandbox_channel: Channel<Msg>,
    attacker_handle: server::Handle,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    logger: Option<Arc<LoggingSession>>,
) {
    let mut parser = CommandParser::new();

    loop {
        tokio::select! {
            input = input_rx.recv() => {
                match input {
                    Some(data) => {
                        if let Err(e) = sandbox_channel.data(&data[..]).await {
                            tracing::warn!(error = %e, "failed to forward attacker bytes to sandbox");
                        }

                        match std::str::from_utf8(&data) {
                            Ok(text) => {
                                parser.add_to_cmd_buffer(text);
                                while let Some(command) = parser.read_command() {
                                    if let Some(logger) = &logger {
                                        if let Err(e) = logger.log_event(Event::Command { input: command }).await {
                                            tracing::warn!(error = %e, "failed to log command");
                                        }
                                    }
                                }
                            }
                            Err(_) => tracing::debug!("discarding non-utf8 attacker input"),
                        }
                    }
                    None => {
                        let _ = sandbox_channel.eof().await;
                        break;
                    }
                }
            }
            message = sandbox_channel.wait() => {
                match message {
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if let Some(logger) = &logger {
                            if let Err(e) = logger
                                .log_event(Event::ChannelOutput { channel: local_id, data: data.to_vec() })
                                .await
                            {
                                tracing::warn!(error = %e, "failed to log channel output");
                            }
                        }
                        let _ = attacker_handle.data(attacker_channel, CryptoVec::from_slice(&data)).await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let _ = attacker_handle.exit_status_request(attacker_channel, exit_status).await;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        let _ = attacker_handle.eof(attacker_channel).await;
                        let _ = attacker_handle.close(attacker_channel).await;
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

async fn connect_to_sandbox(
    target: &AcquiredTargetSystem,
    user: &str,
    password: &str,
) -> Result<client::Handle<SandboxHandler>, ProxyError> {
    let address = format!("{}:{}", target.address, target.port);
    let config = Arc::new(client::Config::default());
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..SANDBOX_CONNECT_RETRIES {
        let outcome: anyhow::Result<client::Handle<SandboxHandler>> = async {
            let mut handle = client::connect(Arc::clone(&config), address.as_str(), SandboxHandler).await?;
            if handle.authenticate_password(user, password).await? {
                Ok(handle)
            } else {
                Err(anyhow::anyhow!("sandbox rejected credentials"))
            }
        }
        .await;

        match outcome {
            Ok(handle) => return Ok(handle),
            Err(e) if e.to_string().contains("rejected credentials") => {
                return Err(ProxyError::AuthenticationFailed);
            }
            Err(e) => last_error = Some(e),
        }

        let delay = Duration::from_millis(SANDBOX_CONNECT_BASE_MS * 2u64.saturating_pow(attempt));
        tracing::warn!(attempt, target = %target.address, retry_in = ?delay, "sandbox connect failed, retrying");
        tokio::time::sleep(delay).await;
    }

    Err(ProxyError::ConnectFailed(
        last_error.unwrap_or_else(|| anyhow::anyhow!("sandbox connect retries exhausted")),
    ))
}

/// Outbound SSH client handler for the connection to a sandbox. Sandboxes
/// are freshly provisioned, disposable containers with no prior identity to
/// pin a host key against, so any key is accepted; isolation comes from the
/// orchestrator's per-session container boundary, not transport trust.
pub struct SandboxHandler;

#[async_trait]
impl client::Handler for SandboxHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl Drop for ProxyHandler {
    fn drop(&mut self) {
        if !self.yielded.load(Ordering::Acquire) {
            tracing::error!(target = %self.target.id, "proxy handler dropped without yielding its target system");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_messages_are_stable() {
        assert_eq!(ProxyError::Unavailable.to_string(), "no sandbox is currently available");
        assert_eq!(
            ProxyError::AuthenticationFailed.to_string(),
            "sandbox rejected the attacker's credentials"
        );
    }

    #[test]
    fn test_connect_backoff_formula_matches_spec() {
        let delays: Vec<u64> = (0..4)
            .map(|i| SANDBOX_CONNECT_BASE_MS * 2u64.saturating_pow(i))
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1600]);
    }
}
