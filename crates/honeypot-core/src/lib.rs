//! honeypot-core: shared types, configuration, and error plumbing for the
//! SSH honeypot workspace.
//!
//! This crate has no async runtime dependencies beyond what's needed for
//! `async_trait`-free shared types; both the frontend and orchestrator
//! binaries depend on it for config loading, domain identifiers, and the
//! error enums that cross their shared `honeypot-protocol` boundary.

pub mod backoff;
pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use backoff::ExponentialBackoff;
pub use error::HoneypotError;
pub use types::{TargetSystemId, TargetSystemState};
