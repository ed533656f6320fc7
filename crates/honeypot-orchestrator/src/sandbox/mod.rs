//! Sandbox lifecycle: container provisioning, readiness, and teardown
//!
//! One [`SandboxOrchestrator`] owns the Docker socket for the process. Every
//! acquired target system is tracked in an in-memory registry keyed by its
//! [`TargetSystemId`] so a leaked handle (a session that crashed without
//! yielding) can still be found and force-removed by the shutdown reaper.

mod lifecycle;

use std::sync::Arc;

use bollard::Docker;
use dashmap::DashMap;
use thiserror::Error;

use honeypot_core::config::OrchestratorConfig;
use honeypot_core::types::{TargetSystemId, TargetSystemState};

/// Label applied to every container this orchestrator creates, so the
/// shutdown reaper and any operator tooling can select on it without
/// touching containers it doesn't own.
pub const ROLE_LABEL: &str = "honeypot.orchestrator.role";
/// Value of [`ROLE_LABEL`] on a target (attacker-facing SSH) container.
pub const ROLE_TARGET: &str = "target";
/// Value of [`ROLE_LABEL`] on a packet-capture sidecar container.
pub const ROLE_CAPTURE: &str = "capture";
/// Label carrying the sandbox id a container belongs to, as a hex string.
pub const SANDBOX_ID_LABEL: &str = "honeypot.orchestrator.sandbox-id";

/// SSH server image the target container runs. Accepts `USER_NAME`/
/// `USER_PASSWORD` environment variables, matching the credential-handoff
/// contract the original prototype's `container.py` sketched out.
pub const TARGET_IMAGE: &str = "ghcr.io/linuxserver/openssh-server";
/// Network-diagnostics image used for the capture sidecar; ships `tcpdump`.
pub const CAPTURE_IMAGE: &str = "nicolaka/netshoot";
/// Path inside the capture sidecar's volume the pcap is written to.
pub const CAPTURE_PATH: &str = "/netlog/log.pcap";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("target system {0:08x} was not recognized by this orchestrator")]
    NotFound(u32),
    #[error("timed out waiting for target system {0:08x} to become ready")]
    ReadinessTimeout(u32),
    #[error("timed out waiting for target system {0:08x} to exit")]
    ExitTimeout(u32),
    #[error("at most {0} target systems may be provisioned concurrently")]
    CapacityExceeded(u32),
    #[error("failed to parse harvested packet capture: {0}")]
    PcapParse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bookkeeping for one provisioned sandbox, from creation through teardown.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: TargetSystemId,
    pub container_name: String,
    pub sidecar_name: String,
    pub network_name: Option<String>,
    pub volume_name: String,
    pub host_port: u32,
    pub state: TargetSystemState,
}

/// Owns the Docker client and the registry of sandboxes currently on loan.
pub struct SandboxOrchestrator {
    pub(crate) docker: Docker,
    pub(crate) config: OrchestratorConfig,
    pub(crate) registry: DashMap<TargetSystemId, SandboxRecord>,
}

impl SandboxOrchestrator {
    pub fn new(docker: Docker, config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            docker,
            config,
            registry: DashMap::new(),
        })
    }

    /// Number of sandboxes currently on loan (not yet yielded).
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn get(&self, id: TargetSystemId) -> Option<SandboxRecord> {
        self.registry.get(&id).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_distinct() {
        assert_ne!(ROLE_TARGET, ROLE_CAPTURE);
    }
}
