//! Canonical encoding of message headers.
//!
//! All multi-byte integers are little-endian and fields are written in
//! declaration order with no padding. Signing and id derivation operate on
//! this encoding with selected fields zeroed:
//!
//! - signing bytes: header with `id` and `signature` zeroed, then payload
//! - id bytes: header with `id` zeroed (signature populated), then payload

use crate::error::{CodecError, Result};
use crate::types::*;
use bytes::{Buf, BufMut};

/// Write a header in wire order.
pub fn encode_header<B: BufMut>(header: &Header, buf: &mut B) {
    buf.put_u64_le(header.version.0);
    buf.put_slice(header.signature.as_bytes());
    buf.put_slice(header.author.as_bytes());
    buf.put_slice(header.id.as_bytes());
    buf.put_slice(header.prev.as_bytes());
    buf.put_slice(header.link.as_bytes());
    buf.put_u64_le(header.seq);
    buf.put_u64_le(header.timestamp);
    buf.put_u32_le(header.msg_type);
    buf.put_u32_le(header.size);
}

/// Read a header in wire order.
pub fn decode_header<B: Buf>(buf: &mut B) -> Result<Header> {
    if buf.remaining() < HEADER_LEN {
        return Err(CodecError::Truncated {
            need: HEADER_LEN,
            have: buf.remaining(),
        });
    }
    let version = Version(buf.get_u64_le());
    let signature = Signature(take(buf));
    let author = UserId(take(buf));
    let id = MsgId(take(buf));
    let prev = MsgId(take(buf));
    let link = MsgId(take(buf));
    Ok(Header {
        version,
        signature,
        author,
        id,
        prev,
        link,
        seq: buf.get_u64_le(),
        timestamp: buf.get_u64_le(),
        msg_type: buf.get_u32_le(),
        size: buf.get_u32_le(),
    })
}

fn take<B: Buf, const N: usize>(buf: &mut B) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

/// Header followed by payload, exactly as currently populated.
pub fn canonical_bytes(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_header(header, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Bytes covered by the author's signature.
pub fn signing_bytes(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut h = *header;
    h.id = MsgId::ZERO;
    h.signature = Signature::ZERO;
    canonical_bytes(&h, payload)
}

/// Bytes hashed into the message id.
pub fn id_bytes(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut h = *header;
    h.id = MsgId::ZERO;
    canonical_bytes(&h, payload)
}
