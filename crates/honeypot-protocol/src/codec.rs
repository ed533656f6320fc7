//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Message;
use crate::request_id::RequestId;

/// A complete frame with header and payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Request this frame belongs to
    pub request_id: RequestId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(request_id: RequestId, message: Message) -> Self {
        Self {
            request_id,
            message,
        }
    }
}

/// Codec for encoding/decoding provider RPC frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload_bytes)?;

        Ok(Some(Frame {
            request_id: header.request_id,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(frame.request_id, frame.message.message_type(), payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;

    #[test]
    fn test_codec_roundtrip_acquire() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(
            RequestId::new(1),
            Message::AcquireTargetSystem {
                user: "root".into(),
                password: "toor".into(),
            },
        );

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.request_id, frame.request_id);
        match decoded.message {
            Message::AcquireTargetSystem { user, password } => {
                assert_eq!(user, "root");
                assert_eq!(password, "toor");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(RequestId::new(1), Message::TargetSystemUnavailable);

        let mut full_buf = BytesMut::new();
        codec.encode(frame, &mut full_buf).unwrap();

        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert!(matches!(decoded.message, Message::TargetSystemUnavailable));
    }

    #[test]
    fn test_codec_yield_event_roundtrip() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(
            RequestId::new(9),
            Message::YieldEvent {
                event: crate::message::DownloadEvent {
                    timestamp_millis: 1_700_000_000_000,
                    source_address: crate::message::SourceAddress::V4(std::net::Ipv4Addr::new(
                        10, 0, 0, 5,
                    )),
                    url: Some("http://10.0.0.5/payload.sh".into()),
                    mime_type: "text/x-shellscript".into(),
                    data: vec![0x23, 0x21, 0x2f, 0x62, 0x69, 0x6e],
                },
            },
        );

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded.message {
            Message::YieldEvent { event } => {
                assert_eq!(event.mime_type, "text/x-shellscript");
                assert_eq!(event.data, vec![0x23, 0x21, 0x2f, 0x62, 0x69, 0x6e]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
