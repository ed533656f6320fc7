//! Configuration loading for the honeypot workspace
//!
//! Every binary follows the same two-layer model: a TOML file provides the
//! base configuration (useful for local development and container images
//! that bake in defaults), and the operator-facing environment variables
//! enumerated in each config struct's `apply_env_overrides` always win when
//! set, matching how the upstream honeypot is configured in production.

mod frontend;
mod orchestrator;

pub use frontend::FrontendConfig;
pub use orchestrator::{BackoffConfig, OrchestratorConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("honeypot")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a TOML file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a TOML file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Load a config file if present, falling back to defaults, then overlay
/// environment variables. Used by both binaries' startup sequence.
pub fn load_with_env_overrides<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config::<T>(path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => T::default(),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to load config file, using defaults");
            T::default()
        }
    }
}

/// `Duration` serialization as whole seconds, shared by every config struct
/// that needs a human-editable interval in its TOML representation.
pub(crate) mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
