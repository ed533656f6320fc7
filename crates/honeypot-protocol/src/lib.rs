//! honeypot-protocol: wire protocol for the target-system provider RPC
//!
//! This crate defines the binary protocol spoken between the frontend proxy
//! and the sandbox orchestrator. It is deliberately not SSH: the provider
//! RPC is a private control-plane channel, while attacker traffic and
//! sandbox traffic both ride real SSH connections handled elsewhere.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod request_id;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{DownloadEvent, Message, MessageType, SourceAddress, PROTOCOL_VERSION};
pub use request_id::RequestId;
