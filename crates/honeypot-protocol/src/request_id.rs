//! Request identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates a provider-RPC request with its response(s).
///
/// Unlike a session id, a `RequestId` is not long-lived: it is minted by the
/// frontend's provider client for one `Acquire`/`Yield` call and retired once
/// the matching response (or response stream) completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Create a new request id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl From<u32> for RequestId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Monotonic generator for request ids, shared by the single provider client
/// instance across all proxy handlers.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: std::sync::atomic::AtomicU32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: std::sync::atomic::AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_display() {
        assert_eq!(format!("{}", RequestId::new(7)), "req-7");
    }

    #[test]
    fn test_generator_is_monotonic_and_unique() {
        let gen = RequestIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert!(b.as_u32() > a.as_u32());
    }
}
