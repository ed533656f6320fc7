//! Process-wide frontend state
//!
//! Constructed once at startup and handed down to every accepted connection
//! as an `Arc`. There is no mutable global state beyond these handles: the
//! session registry and logger pool guard their own internals.

use std::sync::Arc;

use honeypot_core::config::FrontendConfig;
use regex::Regex;

use crate::logger::EventLogger;
use crate::provider::ProviderClient;
use crate::session::SessionManager;

pub struct FrontendState {
    pub config: FrontendConfig,
    pub sessions: Arc<SessionManager>,
    pub provider: Arc<ProviderClient>,
    pub logger: Option<Arc<EventLogger>>,
    /// Compiled once at startup from `config.ssh_allowed_usernames_regex` so
    /// every login attempt doesn't pay recompilation cost.
    pub allowed_usernames_regex: Option<Regex>,
    pub allowed_passwords_regex: Option<Regex>,
}

impl FrontendState {
    pub fn new(
        config: FrontendConfig,
        sessions: Arc<SessionManager>,
        provider: Arc<ProviderClient>,
        logger: Option<Arc<EventLogger>>,
    ) -> Self {
        let allowed_usernames_regex = config
            .ssh_allowed_usernames_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "invalid SSH_ALLOWED_USERNAMES_REGEX, ignoring");
                None
            });
        let allowed_passwords_regex = config
            .ssh_allowed_passwords_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "invalid SSH_ALLOWED_PASSWORDS_REGEX, ignoring");
                None
            });

        Self {
            config,
            sessions,
            provider,
            logger,
            allowed_usernames_regex,
            allowed_passwords_regex,
        }
    }
}
