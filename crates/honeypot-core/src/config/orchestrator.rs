//! Configuration for the backend sandbox orchestrator

use serde::{Deserialize, Serialize};

use super::BackoffConfig;

/// Configuration for the sandbox orchestrator: where target systems are
/// reachable from, where its own provider RPC/HTTP control surface binds,
/// and container lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Host (reachable by attacker-facing SSH proxy connections) that
    /// provisioned target systems are addressed through.
    pub target_system_address: String,

    /// Bind address for the HTTP/provider-RPC control surface.
    pub http_api_bind_address: String,

    /// Give each target system container its own isolated Docker network
    /// instead of sharing a default bridge network with its peers.
    pub enable_isolated_target_container_networks: bool,

    /// Skip removing a target system's volumes on teardown, so an operator
    /// can inspect the filesystem left behind by an attacker.
    pub keep_target_system_volumes: bool,

    /// Backoff applied to container create/start retries.
    pub backoff: BackoffConfig,

    /// Maximum number of target systems provisioned at once.
    pub max_concurrent_target_systems: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            target_system_address: "127.0.0.1".to_string(),
            http_api_bind_address: "0.0.0.0:80".to_string(),
            enable_isolated_target_container_networks: false,
            keep_target_system_volumes: false,
            backoff: BackoffConfig::default(),
            max_concurrent_target_systems: None,
        }
    }
}

impl OrchestratorConfig {
    /// Overlay values found in the process environment.
    pub fn apply_env_overrides(mut self) -> Self {
        use std::env::var;

        if let Ok(v) = var("TARGET_SYSTEM_ADDRESS") {
            self.target_system_address = v;
        }
        if let Ok(v) = var("HTTP_API_BIND_ADDRESS") {
            self.http_api_bind_address = v;
        }
        if let Ok(v) = var("ENABLE_ISOLATED_TARGET_CONTAINER_NETWORKS") {
            self.enable_isolated_target_container_networks = parse_bool(&v);
        }
        if let Ok(v) = var("KEEP_TARGET_SYSTEM_VOLUMES") {
            self.keep_target_system_volumes = parse_bool(&v);
        }

        self
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Exponential backoff configuration, shared by the frontend's provider
/// client and the orchestrator's container-provisioning retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "super::humantime_serde")]
    pub initial: std::time::Duration,

    /// Maximum delay
    #[serde(with = "super::humantime_serde")]
    pub max: std::time::Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: std::time::Duration::from_millis(500),
            max: std::time::Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_orchestrator_bind_address() {
        assert_eq!(
            OrchestratorConfig::default().http_api_bind_address,
            "0.0.0.0:80"
        );
    }
}
