//! Attacker-facing SSH server

mod handler;
mod listener;

pub use handler::{ClientHandler, ServerConfig};
pub use listener::{load_or_generate_host_key, SshServer};
