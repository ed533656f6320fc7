//! Message types for the target-system provider RPC

use serde::{Deserialize, Serialize};

/// Protocol version advertised by this crate, mostly useful for diagnostics.
pub const PROTOCOL_VERSION: &str = "1";

/// Message type identifier, stored in the frame header so a decoder can
/// validate the tag before paying for a full bincode deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// `AcquireTargetSystem` request (frontend -> orchestrator)
    AcquireTargetSystem = 0x01,
    /// Successful acquisition result (orchestrator -> frontend)
    TargetSystemAcquired = 0x02,
    /// No target system is currently free (orchestrator -> frontend)
    TargetSystemUnavailable = 0x03,
    /// `YieldTargetSystem` request (frontend -> orchestrator)
    YieldTargetSystem = 0x04,
    /// One harvested download event, part of a yield response stream
    YieldEvent = 0x05,
    /// Terminates a yield response stream successfully
    YieldComplete = 0x06,
    /// The yielded id was never acquired from this provider
    YieldNotFound = 0x07,
    /// Unrecoverable provider-side error, terminates the in-flight request
    ProviderError = 0xFF,
}

impl MessageType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::AcquireTargetSystem),
            0x02 => Some(Self::TargetSystemAcquired),
            0x03 => Some(Self::TargetSystemUnavailable),
            0x04 => Some(Self::YieldTargetSystem),
            0x05 => Some(Self::YieldEvent),
            0x06 => Some(Self::YieldComplete),
            0x07 => Some(Self::YieldNotFound),
            0xFF => Some(Self::ProviderError),
            _ => None,
        }
    }
}

/// The source address recorded against a harvested download, as reconstructed
/// from the sandbox's packet capture. Exactly one variant is ever set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceAddress {
    V4(std::net::Ipv4Addr),
    V6(std::net::Ipv6Addr),
}

/// A single file download reconstructed from the sandbox's pcap, returned as
/// part of a `YieldTargetSystem` response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEvent {
    /// UTC timestamp (milliseconds since epoch) the transfer completed at.
    pub timestamp_millis: u64,
    /// Where the bytes were fetched from, as seen inside the sandbox.
    pub source_address: SourceAddress,
    /// The URL the sandbox used to fetch the file, if reconstructible.
    pub url: Option<String>,
    /// Sniffed MIME type of the payload.
    pub mime_type: String,
    /// Raw file bytes.
    pub data: Vec<u8>,
}

/// Provider RPC messages, carried inside a `Frame`.
///
/// The RPC has two request shapes and several response shapes; a single enum
/// keeps the codec (which only needs to encode/decode *a* message) generic
/// over both directions, mirroring how the rest of the system frames
/// heterogeneous payloads behind one wire type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request a target system for the given captured credentials.
    AcquireTargetSystem { user: String, password: String },

    /// A target system was created and is ready to accept SSH connections.
    TargetSystemAcquired {
        id: String,
        address: String,
        port: u32,
    },

    /// No target system could be provisioned right now.
    TargetSystemUnavailable,

    /// Release a previously acquired target system.
    YieldTargetSystem { id: String },

    /// One event harvested while tearing down the target system.
    YieldEvent { event: DownloadEvent },

    /// The yield stream is complete; no more `YieldEvent`s will follow.
    YieldComplete,

    /// The yielded id was not previously acquired from this provider.
    YieldNotFound,

    /// A hard failure unrelated to `Unavailable`/`NotFound`.
    ProviderError { message: String },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::AcquireTargetSystem { .. } => MessageType::AcquireTargetSystem,
            Message::TargetSystemAcquired { .. } => MessageType::TargetSystemAcquired,
            Message::TargetSystemUnavailable => MessageType::TargetSystemUnavailable,
            Message::YieldTargetSystem { .. } => MessageType::YieldTargetSystem,
            Message::YieldEvent { .. } => MessageType::YieldEvent,
            Message::YieldComplete => MessageType::YieldComplete,
            Message::YieldNotFound => MessageType::YieldNotFound,
            Message::ProviderError { .. } => MessageType::ProviderError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::AcquireTargetSystem,
            MessageType::TargetSystemAcquired,
            MessageType::TargetSystemUnavailable,
            MessageType::YieldTargetSystem,
            MessageType::YieldEvent,
            MessageType::YieldComplete,
            MessageType::YieldNotFound,
            MessageType::ProviderError,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
    }

    #[test]
    fn test_message_type_matches_tag() {
        let msg = Message::TargetSystemAcquired {
            id: "openssh-server1".into(),
            address: "10.0.0.1".into(),
            port: 33221,
        };
        assert_eq!(msg.message_type(), MessageType::TargetSystemAcquired);
    }
}
