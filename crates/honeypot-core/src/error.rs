//! Core error types shared across the honeypot workspace

use honeypot_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the honeypot ecosystem
#[derive(Error, Debug)]
pub enum HoneypotError {
    /// Provider RPC wire error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error reaching or controlling a sandbox
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Attacker-session-level error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reaching, provisioning, or tearing down a sandbox target system
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Authentication to the sandbox's SSH service failed
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// TCP connection to the sandbox was refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// An established connection to the sandbox was lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No target system was available to satisfy an acquire request
    #[error("No target system available")]
    Unavailable,

    /// The target system id was not recognized by the provider
    #[error("Target system not found: {0}")]
    NotFound(String),

    /// The provider RPC server returned a hard failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Container runtime (Docker) call failed
    #[error("Container runtime error: {0}")]
    ContainerRuntime(String),
}

/// Attacker-session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// Session closed unexpectedly
    #[error("Session closed unexpectedly")]
    UnexpectedClose,

    /// Maximum concurrent sessions exceeded
    #[error("Session limit exceeded")]
    LimitExceeded,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
