//! Error types for kit-core

use crate::types::{MsgId, UserId};
use thiserror::Error;

/// Result type alias using [`CodecError`]
pub type Result<T> = std::result::Result<T, CodecError>;

/// Reasons a message fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("bad version 0x{0:x}")]
    BadVersion(u64),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u32),

    #[error("empty payload")]
    EmptyPayload,

    #[error("payload size mismatch: header {declared}, actual {actual}")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("missing timestamp")]
    MissingTimestamp,

    #[error("missing author")]
    MissingAuthor,

    #[error("missing id")]
    MissingId,

    #[error("seq/prev mismatch: seq {seq}, prev {prev}")]
    SeqPrevMismatch { seq: u64, prev: MsgId },

    #[error("invalid public key {0}")]
    InvalidPublicKey(UserId),

    #[error("bad message signature")]
    BadSignature,

    #[error("bad message id: computed {computed}, carried {carried}")]
    IdMismatch { computed: MsgId, carried: MsgId },
}

/// Errors building, sealing, or decoding messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("message already sealed")]
    AlreadySealed,

    #[error("key {0} does not own this message")]
    WrongKey(UserId),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("unknown message type {0}")]
    UnknownType(u32),
}
