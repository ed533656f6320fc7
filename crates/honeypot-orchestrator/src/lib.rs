//! honeypot-orchestrator: sandbox lifecycle and provider RPC server
//!
//! Owns the container runtime socket. Accepts `AcquireTargetSystem`/
//! `YieldTargetSystem` calls from the frontend over a private frame
//! protocol, provisions disposable SSH-accessible sandboxes plus an
//! attached packet-capture sidecar per sandbox, and harvests downloaded
//! files from the capture on teardown.

pub mod pcap;
pub mod reaper;
pub mod rpc;
pub mod sandbox;
pub mod state;
pub(crate) mod tar;

pub use sandbox::{SandboxError, SandboxOrchestrator};
pub use state::OrchestratorState;
