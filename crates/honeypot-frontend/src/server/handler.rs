//! Attacker-facing SSH server handler
//!
//! Implements the server side of the SSH v2 protocol for one attacker
//! connection and translates protocol callbacks into Proxy-Handler and
//! Logger actions. Owns the attacker transport for the lifetime of the
//! connection; every field here is touched by exactly one task - the one
//! russh drives this `Handler` from.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::PublicKey;

use crate::logger::Event;
use crate::proxy::ProxyHandler;
use crate::session::SessionHandle;
use crate::state::FrontendState;

/// Per-connection SSH state machine; one instance per accepted attacker
/// TCP connection.
pub struct ClientHandler {
    state: Arc<FrontendState>,
    session: Arc<SessionHandle>,
    local_addr: SocketAddr,
    credentials: Option<(String, String)>,
    proxy: Option<ProxyHandler>,
    /// Logging ids for channels never opened onto a sandbox (direct-tcpip
    /// requests are refused outright, so they never enter `ProxyHandler`'s
    /// own id space).
    next_unproxied_channel_id: AtomicU32,
}

impl ClientHandler {
    pub fn new(state: Arc<FrontendState>, session: Arc<SessionHandle>, local_addr: SocketAddr) -> Self {
        Self {
            state,
            session,
            local_addr,
            credentials: None,
            proxy: None,
            next_unproxied_channel_id: AtomicU32::new(0),
        }
    }

    /// Start (or reuse) this session's logging session.
    async fn ensure_logger(&self) {
        if self.session.logger_session().is_some() {
            return;
        }
        let Some(logger) = &self.state.logger else { return };

        match logger
            .begin(
                self.session.peer_addr.ip(),
                self.session.peer_addr.port(),
                self.local_addr.ip(),
                self.local_addr.port(),
                &self.state.config.ssh_local_version,
            )
            .await
        {
            Ok(started) => self.session.set_logger_session(started),
            Err(e) => tracing::warn!(error = %e, session_id = %self.session.id, "failed to start logging session"),
        }
    }

    async fn log(&self, event: Event) {
        if let Some(logger) = self.session.logger_session() {
            if let Err(e) = logger.log_event(event).await {
                tracing::warn!(error = %e, session_id = %self.session.id, "failed to persist event");
            }
        }
    }

    /// Evaluate the configured username/password regexes and success rate.
    /// `ssh_login_success_rate == -1` disables the probabilistic gate
    /// entirely rather than forcing a deny: acceptance then depends only on
    /// whichever regexes are configured.
    fn evaluate_auth(&self, user: &str, password: &str) -> bool {
        if let Some(re) = &self.state.allowed_usernames_regex {
            if !re.is_match(user) {
                return false;
            }
        }
        if let Some(re) = &self.state.allowed_passwords_regex {
            if !re.is_match(password) {
                return false;
            }
        }
        let rate = self.state.config.ssh_login_success_rate;
        if rate < 0 {
            return true;
        }
        let roll: i8 = rand::thread_rng().gen_range(0..100);
        roll < rate
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, _user: &str, _public_key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.ensure_logger().await;
        self.log(Event::LoginAttempt {
            username: user.to_string(),
            password: password.to_string(),
        })
        .await;

        if self.evaluate_auth(user, password) {
            tracing::info!(session_id = %self.session.id, peer = %self.session.peer_addr, user, "login accepted");
            self.session.set_username(user.to_string());
            self.credentials = Some((user.to_string(), password.to_string()));
            Ok(Auth::Accept)
        } else {
            tracing::debug!(session_id = %self.session.id, user, "login rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        self.session.channel_opened();

        if self.proxy.is_none() {
            let Some((user, password)) = self.credentials.clone() else {
                tracing::warn!(session_id = %self.session.id, "channel open before authentication completed");
                return Ok(false);
            };

            match ProxyHandler::acquire(
                Arc::clone(&self.state.provider),
                self.session.logger_session(),
                user,
                password,
            )
            .await
            {
                Ok(proxy) => {
                    let target = proxy.target();
                    self.session.set_target_system(crate::session::AssignedTargetSystem {
                        id: proxy.target_id(),
                        address: target.address.clone(),
                        port: target.port,
                    });
                    self.proxy = Some(proxy);
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session.id, error = %e, "failed to acquire sandbox");
                    return Ok(false);
                }
            }
        }

        match self.proxy.as_mut().unwrap().open_channel(channel_id).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(session_id = %self.session.id, error = %e, "failed to open sandbox channel");
                Ok(false)
            }
        }
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = match &mut self.proxy {
            Some(proxy) => {
                proxy
                    .handle_pty_request(channel, term, col_width, row_height, pix_width, pix_height)
                    .await
            }
            None => false,
        };

        if ok {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(proxy) = &mut self.proxy {
            let _ = proxy
                .handle_window_change_request(channel, col_width, row_height, pix_width, pix_height)
                .await;
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(proxy) = &self.proxy {
            proxy.log_env_request(channel, variable_name, variable_value).await;
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let ok = match &mut self.proxy {
            Some(proxy) => proxy.handle_shell_request(channel, session.handle()).await,
            None => false,
        };

        if ok {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let Ok(command) = std::str::from_utf8(data) else {
            tracing::debug!(session_id = %self.session.id, "exec request with non-utf8 command, rejecting");
            session.channel_failure(channel);
            return Ok(());
        };

        let ok = match &mut self.proxy {
            Some(proxy) => proxy.handle_exec_request(channel, session.handle(), command).await,
            None => false,
        };

        if ok {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        self.session.touch();
        if let Some(proxy) = &self.proxy {
            proxy.forward_attacker_data(channel, data).await;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.session.channel_closed();
        if let Some(proxy) = &mut self.proxy {
            proxy.close_channel(channel);
        }
        Ok(())
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Direct-tcpip (`-L`/`-D`-style) forwarding is outside this honeypot's
    /// emulated surface: the request is logged for fingerprinting but the
    /// channel is always refused.
    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match originator_address.parse() {
            Ok(origin_ip) => {
                let local_id = self.next_unproxied_channel_id.fetch_add(1, Ordering::Relaxed);
                self.log(Event::DirectTcpipRequest {
                    channel: local_id,
                    origin_ip,
                    origin_port: originator_port as u16,
                    destination: host_to_connect.to_string(),
                    destination_port: port_to_connect as u16,
                })
                .await;
            }
            Err(e) => {
                tracing::debug!(
                    session_id = %self.session.id,
                    error = %e,
                    originator_address,
                    "direct-tcpip request with unparseable originator address, dropping event"
                );
            }
        }
        Ok(false)
    }

    /// X11 forwarding is never proxied to the sandbox; the request is logged
    /// against its already-open session channel and then rejected.
    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_authentication_protocol: &str,
        x11_authentication_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let local_id = self.proxy.as_ref().map(|p| p.local_channel_id(channel)).unwrap_or(0);
        self.log(Event::X11Request {
            channel: local_id,
            single_connection,
            auth_protocol: x11_authentication_protocol.to_string(),
            auth_cookie: x11_authentication_cookie.to_string(),
            screen_number: x11_screen_number,
        })
        .await;
        session.channel_failure(channel);
        Ok(())
    }

    /// Remote port forwarding (`-R`) is refused administratively; the
    /// request is still logged as attacker fingerprinting signal.
    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        self.log(Event::PortForwardRequest {
            address: address.to_string(),
            port: *port as u16,
        })
        .await;
        Ok(false)
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            tokio::spawn(async move {
                proxy.close().await;
            });
        }
        if let Some(logger) = self.session.logger_session() {
            tokio::spawn(async move {
                let _ = logger.end().await;
            });
        }
    }
}

/// Builds the `russh` server configuration: host key, banner, and the
/// rejection-timing jitter that makes failed auth attempts indistinguishable
/// from successful ones on the wire.
#[derive(Clone)]
pub struct ServerConfig {
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    pub fn new(host_key: russh_keys::key::KeyPair, local_version: &str) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.server_id = russh::SshId::Standard(local_version.to_string());
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
