//! Message framing for network transport
//!
//! Provides length-prefixed framing of postcard-encoded messages.

use bytes::{Buf, BufMut, BytesMut};
use lpbcast_core::{canonical, Message};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Frame kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Encoded request message
    Request = 0,
    /// Encoded reply message
    Response = 1,
    /// UTF-8 rejection reason
    Error = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Error),
            _ => Err(FrameError::UnknownKind(value)),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes kind byte)
/// - 1 byte: frame kind
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 kind)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("empty frame".into()));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = FrameKind::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.kind as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn request(message: &Message) -> Result<Self, FrameError> {
        Ok(Self::new(FrameKind::Request, encode(message)?))
    }

    pub fn response(message: &Message) -> Result<Self, FrameError> {
        Ok(Self::new(FrameKind::Response, encode(message)?))
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(FrameKind::Error, reason.into().into_bytes())
    }

    /// Decode the carried message
    pub fn message(&self) -> Result<Message, FrameError> {
        canonical::decode(&self.payload).map_err(|e| FrameError::Serialization(e.to_string()))
    }
}

fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    canonical::encode(message).map_err(|e| FrameError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpbcast_core::{NodeId, SubscriptionEntry};

    fn probe() -> Message {
        Message::Probe {
            sender: SubscriptionEntry::new(NodeId::new("127.0.0.1:9200").unwrap(), 1),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::request(&probe()).unwrap();

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Request);
        assert_eq!(decoded.message().unwrap(), probe());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Frame::error("busy"), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[6..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Error);
        assert_eq!(frame.payload, b"busy");
    }

    #[test]
    fn test_rejects_oversized_and_unknown() {
        let mut codec = FrameCodec::new();

        let mut huge = BytesMut::new();
        huge.put_u32((MAX_FRAME_SIZE + 1) as u32);
        huge.put_u8(0);
        assert!(matches!(codec.decode(&mut huge), Err(FrameError::TooLarge(_))));

        let mut unknown = BytesMut::new();
        unknown.put_u32(1);
        unknown.put_u8(9);
        assert!(matches!(
            codec.decode(&mut unknown),
            Err(FrameError::UnknownKind(9))
        ));
    }
}
