//! Mutual authentication and sync negotiation.
//!
//! The initiator sends a [`Hello`] carrying a random nonce signed with its
//! key. The responder checks it and answers with a [`HelloAck`] holding its
//! own signature over the same nonce. The initiator pins the responder's
//! identity in advance, so a successful ack proves it reached the right hub.
//!
//! Both records also carry sync parameters: flags plus an optional cursor
//! naming the last message the sender knows the other side has.

use bytes::{Buf, BufMut};
use kit_core::{KeyPair, MsgId, NetworkId, Nonce, Signature, UserId, Version, VERSION};
use rand::rngs::OsRng;
use rand::RngCore;
use std::future::Future;
use std::ops::BitOr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad version 0x{0:x} in {1}")]
    BadVersion(u64, &'static str),
    #[error("hello for a different network")]
    NetworkMismatch,
    #[error("bad hello signature from {0}")]
    BadHelloSignature(UserId),
    #[error("bad hello ack signature, expected {0}")]
    BadAckSignature(UserId),
    #[error("unsupported cursor clock with {0} elements")]
    UnsupportedClock(u64),
}

// =============================================================================
// SYNC PARAMETERS
// =============================================================================

/// Sync flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SyncFlags(pub u64);

impl SyncFlags {
    pub const NONE: SyncFlags = SyncFlags(0);
    /// `cursor` is meaningful.
    pub const HAS_CURSOR: SyncFlags = SyncFlags(1);
    /// Send everything regardless of the cursor.
    pub const SEND_ALL: SyncFlags = SyncFlags(2);
    /// Keep the connection open for live updates.
    pub const FOLLOW: SyncFlags = SyncFlags(4);

    pub fn contains(self, other: SyncFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SyncFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for SyncFlags {
    type Output = SyncFlags;

    fn bitor(self, rhs: SyncFlags) -> SyncFlags {
        SyncFlags(self.0 | rhs.0)
    }
}

/// Sync parameters advertised by one side of a handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncParams {
    pub flags: SyncFlags,
    pub cursor: MsgId,
    pub cursor_count: u64,
}

impl SyncParams {
    pub fn new(cursor: Option<MsgId>, follow: bool) -> Self {
        let mut params = SyncParams::default();
        if follow {
            params.flags.insert(SyncFlags::FOLLOW);
        }
        if let Some(cursor) = cursor {
            params.flags.insert(SyncFlags::HAS_CURSOR);
            params.cursor = cursor;
        }
        params
    }

    pub fn follows(&self) -> bool {
        self.flags.contains(SyncFlags::FOLLOW)
    }

    pub fn cursor(&self) -> Option<MsgId> {
        self.flags
            .contains(SyncFlags::HAS_CURSOR)
            .then_some(self.cursor)
    }

    /// Where to start sending to the side that advertised these params.
    /// `None` means from the beginning.
    pub fn resume_point(&self) -> Option<MsgId> {
        if self.flags.contains(SyncFlags::SEND_ALL) {
            None
        } else {
            self.cursor()
        }
    }

    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.flags.0);
        buf.put_slice(self.cursor.as_bytes());
        buf.put_u64_le(self.cursor_count);
    }

    fn get<B: Buf>(buf: &mut B) -> Result<Self, HandshakeError> {
        let flags = SyncFlags(buf.get_u64_le());
        let cursor = MsgId(take(buf));
        let cursor_count = buf.get_u64_le();
        if cursor_count != 0 {
            return Err(HandshakeError::UnsupportedClock(cursor_count));
        }
        Ok(Self {
            flags,
            cursor,
            cursor_count,
        })
    }
}

fn take<B: Buf, const N: usize>(buf: &mut B) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

// =============================================================================
// WIRE RECORDS
// =============================================================================

/// First record, initiator to responder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub version: Version,
    pub network: NetworkId,
    pub author: UserId,
    pub nonce: Nonce,
    pub signature: Signature,
    pub sync: SyncParams,
}

impl Hello {
    pub const LEN: usize = 8 + 32 + 32 + 64 + 64 + 8 + 32 + 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.version.0);
        buf.put_slice(self.network.as_bytes());
        buf.put_slice(self.author.as_bytes());
        buf.put_slice(self.nonce.as_bytes());
        buf.put_slice(self.signature.as_bytes());
        self.sync.put(&mut buf);
        out
    }

    pub fn decode(bytes: &[u8; Self::LEN]) -> Result<Self, HandshakeError> {
        let mut buf = &bytes[..];
        let version = Version(buf.get_u64_le());
        if version != VERSION {
            return Err(HandshakeError::BadVersion(version.0, "hello"));
        }
        Ok(Self {
            version,
            network: NetworkId(take(&mut buf)),
            author: UserId(take(&mut buf)),
            nonce: Nonce(take(&mut buf)),
            signature: Signature(take(&mut buf)),
            sync: SyncParams::get(&mut buf)?,
        })
    }
}

/// Reply record, responder to initiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloAck {
    pub version: Version,
    pub signature: Signature,
    pub sync: SyncParams,
}

impl HelloAck {
    pub const LEN: usize = 8 + 64 + 8 + 32 + 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.version.0);
        buf.put_slice(self.signature.as_bytes());
        self.sync.put(&mut buf);
        out
    }

    pub fn decode(bytes: &[u8; Self::LEN]) -> Result<Self, HandshakeError> {
        let mut buf = &bytes[..];
        let version = Version(buf.get_u64_le());
        if version != VERSION {
            return Err(HandshakeError::BadVersion(version.0, "hello ack"));
        }
        Ok(Self {
            version,
            signature: Signature(take(&mut buf)),
            sync: SyncParams::get(&mut buf)?,
        })
    }
}

// =============================================================================
// PROTOCOL
// =============================================================================

/// Outcome of a successful handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    /// Authenticated identity of the other side.
    pub remote: UserId,
    /// Sync parameters the other side advertised.
    pub remote_sync: SyncParams,
}

/// Run the initiator side against a responder expected to be `responder`.
pub async fn initiate<S>(
    stream: &mut S,
    key: &KeyPair,
    network: NetworkId,
    responder: UserId,
    sync: SyncParams,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; 64];
    OsRng.fill_bytes(&mut nonce);
    let hello = Hello {
        version: VERSION,
        network,
        author: key.user_id(),
        nonce: Nonce(nonce),
        signature: key.sign(&nonce),
        sync,
    };
    stream.write_all(&hello.encode()).await?;
    stream.flush().await?;

    let mut buf = [0u8; HelloAck::LEN];
    stream.read_exact(&mut buf).await?;
    let ack = HelloAck::decode(&buf)?;
    KeyPair::verify(&responder, &nonce, &ack.signature)
        .map_err(|_| HandshakeError::BadAckSignature(responder))?;

    debug!(peer = %responder, flags = ack.sync.flags.0, "handshake complete");
    Ok(Session {
        remote: responder,
        remote_sync: ack.sync,
    })
}

/// Run the responder side.
///
/// `cursor_for` looks up the cursor this side holds for the authenticated
/// initiator; it is advertised back in the ack.
pub async fn accept<S, F, Fut>(
    stream: &mut S,
    key: &KeyPair,
    network: NetworkId,
    flags: SyncFlags,
    cursor_for: F,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(UserId) -> Fut,
    Fut: Future<Output = Option<MsgId>>,
{
    let mut buf = [0u8; Hello::LEN];
    stream.read_exact(&mut buf).await?;
    let hello = Hello::decode(&buf)?;
    if hello.network != network {
        return Err(HandshakeError::NetworkMismatch);
    }
    KeyPair::verify(&hello.author, hello.nonce.as_bytes(), &hello.signature)
        .map_err(|_| HandshakeError::BadHelloSignature(hello.author))?;

    let mut sync = SyncParams {
        flags,
        ..SyncParams::default()
    };
    if let Some(cursor) = cursor_for(hello.author).await {
        sync.flags.insert(SyncFlags::HAS_CURSOR);
        sync.cursor = cursor;
    }
    let ack = HelloAck {
        version: VERSION,
        signature: key.sign(hello.nonce.as_bytes()),
        sync,
    };
    stream.write_all(&ack.encode()).await?;
    stream.flush().await?;

    debug!(peer = %hello.author, flags = hello.sync.flags.0, "accepted handshake");
    Ok(Session {
        remote: hello.author,
        remote_sync: hello.sync,
    })
}
