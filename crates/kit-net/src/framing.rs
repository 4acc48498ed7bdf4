//! Message framing for network transport
//!
//! A message is its own frame: the fixed 224-byte header carries the payload
//! size, so no extra length prefix is written.
//!
//! The decoder only checks framing. Verification happens one level up in
//! [`crate::conn::MessageReader`] so that a bad message does not poison the
//! rest of the stream.

use bytes::{Buf, BytesMut};
use kit_core::{CodecError, Message, HEADER_LEN, MAX_PAYLOAD_SIZE};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Offset of the `size` field inside the header.
const SIZE_OFFSET: usize = HEADER_LEN - 4;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Message(#[from] CodecError),
    #[error("invalid message: {0}")]
    Invalid(#[from] kit_core::VerifyError),
}

impl FrameError {
    /// Whether the stream can keep going after this error.
    pub fn is_message_level(&self) -> bool {
        matches!(self, FrameError::Invalid(_))
    }
}

/// Codec for kit messages
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        // Peek at size before buffering the payload
        let size = (&src[SIZE_OFFSET..HEADER_LEN]).get_u32_le() as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge(size));
        }

        let frame_len = HEADER_LEN + size;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        Ok(Some(Message::parse(frame)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge(item.payload.len()));
        }
        dst.reserve(item.encoded_len());
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kit_core::{Change, KeyPair, MsgId, Payload};

    fn sealed(diff: &str) -> Message {
        let kp = KeyPair::generate();
        let mut msg = Message::new(
            kp.user_id(),
            0,
            MsgId::ZERO,
            &Payload::from(Change { diff: diff.into() }),
        )
        .unwrap();
        msg.seal(&kp).unwrap();
        msg
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = MessageCodec::new();
        let a = sealed("one");
        let b = sealed("two");

        let mut buf = BytesMut::new();
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec::new();
        let msg = sealed("partial");
        let encoded = msg.encode();

        let mut buf = BytesMut::from(&encoded[..HEADER_LEN + 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[HEADER_LEN + 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_oversized_frame_rejected_before_payload() {
        let mut codec = MessageCodec::new();
        let mut header = vec![0u8; HEADER_LEN];
        header[SIZE_OFFSET..].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        let mut buf = BytesMut::from(&header[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge(n)) if n == MAX_PAYLOAD_SIZE + 1
        ));
    }
}
