//! SSH server listener
//!
//! Accepts incoming attacker connections and spawns a [`ClientHandler`] for
//! each one, registering its bookkeeping with the [`SessionManager`] before
//! handing the socket to `russh`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::server::handler::{ClientHandler, ServerConfig};
use crate::state::FrontendState;

/// SSH server that listens for incoming attacker connections.
pub struct SshServer {
    config: ServerConfig,
    state: Arc<FrontendState>,
    cancel: CancellationToken,
}

impl SshServer {
    pub fn new(host_key: KeyPair, state: Arc<FrontendState>, cancel: CancellationToken) -> Self {
        let config = ServerConfig::new(host_key, &state.config.ssh_local_version);
        Self { config, state, cancel }
    }

    /// Run the accept loop until cancelled.
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind to {}", bind_addr))?;

        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "SSH server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr, local_addr);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Register the connection's session bookkeeping and spawn its handler.
    fn handle_connection(&self, socket: tokio::net::TcpStream, peer_addr: SocketAddr, local_addr: SocketAddr) {
        let session = match self.state.sessions.register(peer_addr) {
            Ok(session) => session,
            Err(_) => {
                tracing::warn!(%peer_addr, "rejecting connection: session limit exceeded");
                return;
            }
        };

        tracing::info!(%peer_addr, session_id = %session.id, "accepted connection");

        let ssh_config = Arc::clone(&self.config.ssh_config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let sessions = Arc::clone(&self.state.sessions);
        let session_id = session.id;

        tokio::spawn(async move {
            let handler = ClientHandler::new(Arc::clone(&state), session, local_addr);

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(%peer_addr, "connection handler cancelled");
                    sessions.remove(session_id);
                    return;
                }
                result = russh::server::run_stream(ssh_config, socket, handler) => result
            };

            match result {
                Ok(_) => tracing::info!(%peer_addr, "connection closed normally"),
                Err(e) => tracing::warn!(%peer_addr, error = %e, "connection closed with error"),
            }

            sessions.remove(session_id);
        });
    }
}

/// Load the host key from `path`, generating and persisting a new Ed25519
/// key there if it doesn't exist yet, so restarts keep the same identity.
pub async fn load_or_generate_host_key(path: &std::path::Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!(?path, "loading host key");
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!(?path, "generating new host key");

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }

    let owned_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || generate_ed25519_host_key(&owned_path))
        .await
        .context("host key generation task panicked")??;

    let key = russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load freshly generated host key from {:?}", path))?;
    Ok(key)
}

/// `russh_keys` has no OpenSSH-format private key writer, so shell out to
/// `ssh-keygen` the same way the key is generated for any other role this
/// workspace provisions identities for.
fn generate_ed25519_host_key(path: &std::path::Path) -> Result<()> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("host key path contains invalid UTF-8: {:?}", path))?;

    let status = std::process::Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-f", path_str, "-N", "", "-C", "honeypot-frontend", "-q"])
        .status()
        .context("failed to run ssh-keygen")?;

    if !status.success() {
        anyhow::bail!("ssh-keygen exited with status: {}", status);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}
