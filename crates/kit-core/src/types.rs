//! Core protocol types for kit.
//!
//! The message header is a fixed-width little-endian record. Field order
//! here is wire order; see [`crate::canonical`] for the encoding.

use bytes::Bytes;
use std::fmt;

/// Protocol version tag carried by every message and handshake record.
pub const VERSION: Version = Version(0x0000_0000_0074_696b);

/// Largest payload a message may carry.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 8 + 64 + 32 + 32 + 32 + 32 + 8 + 8 + 4 + 4;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;
            pub const ZERO: Self = Self([0u8; $len]);

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let mut out = [0u8; $len];
                hex::decode_to_slice(s.trim(), &mut out)?;
                Ok(Self(out))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ZERO
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..4]))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }
    };
}

byte_id!(
    /// Message identifier: SHA-256 over the signed encoding with `id` zeroed.
    MsgId,
    32
);

byte_id!(
    /// Ed25519 public key of a chain owner.
    UserId,
    32
);

byte_id!(
    /// Deployment identifier exchanged during the handshake.
    NetworkId,
    32
);

byte_id!(
    /// Detached Ed25519 signature.
    Signature,
    64
);

byte_id!(Nonce, 64);

/// Protocol version tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Version(pub u64);

// =============================================================================
// MESSAGE TYPE
// =============================================================================

/// Payload discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    Register = 1,
    Change = 2,
}

impl MsgType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MsgType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(MsgType::Register),
            2 => Ok(MsgType::Change),
            other => Err(other),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgType::Register => f.write_str("register"),
            MsgType::Change => f.write_str("change"),
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// Fixed-width message header.
///
/// `msg_type` stays a raw `u32` so that headers with unknown types can be
/// decoded and then rejected by verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Header {
    pub version: Version,
    pub signature: Signature,
    pub author: UserId,
    pub id: MsgId,
    pub prev: MsgId,
    pub link: MsgId,
    pub seq: u64,
    pub timestamp: u64,
    pub msg_type: u32,
    pub size: u32,
}

/// A journal entry: header plus opaque payload.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        let text = String::from_utf8_lossy(&self.payload);
        let text: String = text.chars().take(30).collect();
        write!(
            f,
            "u:{} i:{} s:{} t:{} sz:{} {}",
            h.author, h.id, h.seq, h.msg_type, h.size, text
        )
    }
}
