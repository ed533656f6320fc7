//! Core domain types shared across the honeypot workspace

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a provisioned target system (sandbox container).
///
/// Mirrors the original provider's `container_id = uuid4().int % 2**32`
/// scheme: a 32-bit value is plenty to avoid collisions among the small
/// number of sandboxes alive at once, and fits directly in the provider RPC
/// wire messages without an extra encoding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetSystemId(pub u32);

impl TargetSystemId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TargetSystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for TargetSystemId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a target system, tracked by the sandbox orchestrator
/// from the moment a container is requested to the moment it is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSystemState {
    /// Container create/start is in flight.
    Creating,
    /// Container is running and its SSH service has answered a readiness probe.
    Ready,
    /// Handed out to a frontend proxy handler; in use by an attacker session.
    Acquired,
    /// The attacker session ended; teardown (pcap harvest, stop) is in flight.
    Exiting,
    /// Container and its volumes have been removed.
    Destroyed,
}

impl fmt::Display for TargetSystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetSystemState::Creating => "creating",
            TargetSystemState::Ready => "ready",
            TargetSystemState::Acquired => "acquired",
            TargetSystemState::Exiting => "exiting",
            TargetSystemState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_system_id_display_is_fixed_width_hex() {
        let id = TargetSystemId::new(0xabcd);
        assert_eq!(id.to_string(), "0000abcd");
    }

    #[test]
    fn test_target_system_state_display() {
        assert_eq!(TargetSystemState::Ready.to_string(), "ready");
        assert_eq!(TargetSystemState::Destroyed.to_string(), "destroyed");
    }
}
