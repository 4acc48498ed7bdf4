//! Message construction, sealing and verification.

use crate::canonical::{decode_header, encode_header, id_bytes, signing_bytes};
use crate::crypto::{hash_id, unix_now, KeyPair};
use crate::error::{CodecError, Result, VerifyError};
use crate::payload::Payload;
use crate::types::*;
use bytes::{BufMut, Bytes, BytesMut};

impl Message {
    /// Build an unsealed message carrying `payload`.
    pub fn new(author: UserId, seq: u64, prev: MsgId, payload: &Payload) -> Result<Self> {
        let bytes = payload.encode()?;
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(bytes.len()));
        }
        let header = Header {
            author,
            prev,
            seq,
            msg_type: payload.msg_type().as_u32(),
            ..Header::default()
        };
        Ok(Self {
            header,
            payload: Bytes::from(bytes),
        })
    }

    pub fn from_parts(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn id(&self) -> MsgId {
        self.header.id
    }

    pub fn author(&self) -> UserId {
        self.header.author
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn prev(&self) -> MsgId {
        self.header.prev
    }

    pub fn msg_type(&self) -> std::result::Result<MsgType, u32> {
        MsgType::try_from(self.header.msg_type)
    }

    /// Sign the message and derive its id.
    ///
    /// Fills in version, size and (if unset) timestamp. The message must not
    /// be sealed already and `key` must belong to the author.
    pub fn seal(&mut self, key: &KeyPair) -> Result<()> {
        if !self.header.id.is_zero() || !self.header.signature.is_zero() {
            return Err(CodecError::AlreadySealed);
        }
        if key.user_id() != self.header.author {
            return Err(CodecError::WrongKey(key.user_id()));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }
        self.header.version = VERSION;
        self.header.size = self.payload.len() as u32;
        if self.header.timestamp == 0 {
            self.header.timestamp = unix_now();
        }

        self.header.signature = key.sign(&signing_bytes(&self.header, &self.payload));
        self.header.id = hash_id(&id_bytes(&self.header, &self.payload));
        self.verify()?;
        Ok(())
    }

    /// Check every structural and cryptographic invariant.
    pub fn verify(&self) -> std::result::Result<(), VerifyError> {
        let h = &self.header;
        if h.version != VERSION {
            return Err(VerifyError::BadVersion(h.version.0));
        }
        if h.size as usize > MAX_PAYLOAD_SIZE {
            return Err(VerifyError::PayloadTooLarge(h.size));
        }
        if h.size == 0 {
            return Err(VerifyError::EmptyPayload);
        }
        if h.size as usize != self.payload.len() {
            return Err(VerifyError::SizeMismatch {
                declared: h.size,
                actual: self.payload.len(),
            });
        }
        MsgType::try_from(h.msg_type).map_err(VerifyError::UnknownType)?;
        if h.timestamp == 0 {
            return Err(VerifyError::MissingTimestamp);
        }
        if h.author.is_zero() {
            return Err(VerifyError::MissingAuthor);
        }
        if h.id.is_zero() {
            return Err(VerifyError::MissingId);
        }
        if (h.seq == 0) != h.prev.is_zero() {
            return Err(VerifyError::SeqPrevMismatch {
                seq: h.seq,
                prev: h.prev,
            });
        }

        KeyPair::verify(&h.author, &signing_bytes(h, &self.payload), &h.signature)?;
        let computed = hash_id(&id_bytes(h, &self.payload));
        if computed != h.id {
            return Err(VerifyError::IdMismatch {
                computed,
                carried: h.id,
            });
        }
        Ok(())
    }

    /// Decode the payload according to the header type.
    pub fn payload(&self) -> Result<Payload> {
        Payload::decode(self.header.msg_type, &self.payload)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Header and payload as currently populated.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        encode_header(&self.header, buf);
        buf.put_slice(&self.payload);
    }

    /// Split one encoded message into header and payload without verifying.
    ///
    /// `bytes` must hold exactly one message.
    pub fn parse(mut bytes: Bytes) -> Result<Self> {
        let have = bytes.len();
        let header = decode_header(&mut bytes)?;
        let size = header.size as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(VerifyError::PayloadTooLarge(header.size).into());
        }
        if bytes.len() < size {
            return Err(CodecError::Truncated {
                need: HEADER_LEN + size,
                have,
            });
        }
        let payload = bytes.split_to(size);
        Ok(Self { header, payload })
    }

    /// Parse and verify one encoded message.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let msg = Self::parse(bytes)?;
        msg.verify()?;
        Ok(msg)
    }
}
