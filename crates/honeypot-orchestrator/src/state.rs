//! Process-wide orchestrator state

use std::sync::Arc;

use honeypot_core::config::OrchestratorConfig;

use crate::sandbox::SandboxOrchestrator;

pub struct OrchestratorState {
    pub config: OrchestratorConfig,
    pub sandboxes: Arc<SandboxOrchestrator>,
}

impl OrchestratorState {
    pub fn new(config: OrchestratorConfig, sandboxes: Arc<SandboxOrchestrator>) -> Self {
        Self { config, sandboxes }
    }
}
