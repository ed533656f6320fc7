//! Attacker session registry
//!
//! An attacker session is the triple of an accepted SSH transport, the
//! proxy handler forwarding its channels to a sandbox, and the bookkeeping
//! this module tracks (last activity, open channel count, assigned target
//! system). One [`SessionHandle`] is registered per accepted TCP connection
//! for the lifetime of that connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use honeypot_core::time::current_time_millis;
use honeypot_core::types::TargetSystemId;
use thiserror::Error;

use crate::logger::LoggingSession;

/// Identifies an attacker session for the lifetime of its SSH transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Monotonic generator for [`SessionId`]s.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A target system assigned to a session, as acquired from the orchestrator.
#[derive(Debug, Clone)]
pub struct AssignedTargetSystem {
    pub id: TargetSystemId,
    pub address: String,
    pub port: u32,
}

/// Bookkeeping for one accepted attacker connection.
pub struct SessionHandle {
    pub id: SessionId,
    pub peer_addr: SocketAddr,
    pub created_at_millis: u64,
    last_activity_millis: AtomicU64,
    open_channels: AtomicUsize,
    closing: AtomicBool,
    username: Mutex<Option<String>>,
    target_system: Mutex<Option<AssignedTargetSystem>>,
    logger_session: Mutex<Option<Arc<LoggingSession>>>,
}

impl SessionHandle {
    fn new(id: SessionId, peer_addr: SocketAddr) -> Self {
        let now = current_time_millis();
        Self {
            id,
            peer_addr,
            created_at_millis: now,
            last_activity_millis: AtomicU64::new(now),
            open_channels: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            username: Mutex::new(None),
            target_system: Mutex::new(None),
            logger_session: Mutex::new(None),
        }
    }

    pub fn touch(&self) {
        self.last_activity_millis
            .store(current_time_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity_millis.load(Ordering::Relaxed)
    }

    pub fn channel_opened(&self) {
        self.open_channels.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn channel_closed(&self) {
        self.open_channels.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn open_channel_count(&self) -> usize {
        self.open_channels.load(Ordering::Acquire)
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().expect("lock poisoned").clone()
    }

    pub fn set_username(&self, username: String) {
        *self.username.lock().expect("lock poisoned") = Some(username);
    }

    pub fn target_system(&self) -> Option<AssignedTargetSystem> {
        self.target_system.lock().expect("lock poisoned").clone()
    }

    pub fn set_target_system(&self, target: AssignedTargetSystem) {
        *self.target_system.lock().expect("lock poisoned") = Some(target);
    }

    pub fn logger_session(&self) -> Option<Arc<LoggingSession>> {
        self.logger_session.lock().expect("lock poisoned").clone()
    }

    pub fn set_logger_session(&self, session: Arc<LoggingSession>) {
        *self.logger_session.lock().expect("lock poisoned") = Some(session);
    }

    /// Compare-and-swap the closing flag so exactly one caller (the
    /// supervisor's idle sweep, or the transport's own teardown path) wins
    /// the race to yield this session's target system and remove it from
    /// the registry.
    pub fn try_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Raised when [`SessionManager::register`] would exceed the configured cap.
#[derive(Debug, Error)]
#[error("session limit exceeded")]
pub struct SessionLimitExceeded;

/// Registry of all attacker sessions currently accepted by this process.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    ids: SessionIdGenerator,
    max_sessions: Option<usize>,
}

impl SessionManager {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: DashMap::new(),
            ids: SessionIdGenerator::new(),
            max_sessions,
        }
    }

    /// Register a newly accepted connection, returning its handle.
    pub fn register(&self, peer_addr: SocketAddr) -> Result<Arc<SessionHandle>, SessionLimitExceeded> {
        if let Some(max) = self.max_sessions {
            if self.sessions.len() >= max {
                return Err(SessionLimitExceeded);
            }
        }

        let id = self.ids.next_id();
        let handle = Arc::new(SessionHandle::new(id, peer_addr));
        self.sessions.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|r| Arc::clone(&r))
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&id).map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:2222".parse().unwrap()
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let manager = SessionManager::new(None);
        let a = manager.register(addr()).unwrap();
        let b = manager.register(addr()).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_register_enforces_limit() {
        let manager = SessionManager::new(Some(1));
        manager.register(addr()).unwrap();
        assert!(manager.register(addr()).is_err());
    }

    #[test]
    fn test_try_close_is_single_winner() {
        let manager = SessionManager::new(None);
        let handle = manager.register(addr()).unwrap();
        assert!(handle.try_close());
        assert!(!handle.try_close());
    }

    #[test]
    fn test_channel_count_tracks_open_and_close() {
        let manager = SessionManager::new(None);
        let handle = manager.register(addr()).unwrap();
        handle.channel_opened();
        handle.channel_opened();
        assert_eq!(handle.open_channel_count(), 2);
        handle.channel_closed();
        assert_eq!(handle.open_channel_count(), 1);
    }
}
