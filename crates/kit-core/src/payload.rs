//! Typed message payloads.
//!
//! Payloads are JSON objects. The header `type` selects the decoder.

use crate::error::{CodecError, Result};
use crate::types::MsgType;
use serde::{Deserialize, Serialize};

/// First message of every chain: binds an identity to contact details.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Register {
    pub email: String,
}

/// A change entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    pub diff: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Register(Register),
    Change(Change),
}

type Decoder = fn(&[u8]) -> Result<Payload>;

const DECODERS: &[(MsgType, Decoder)] = &[
    (MsgType::Register, decode_register),
    (MsgType::Change, decode_change),
];

fn decode_register(bytes: &[u8]) -> Result<Payload> {
    Ok(Payload::Register(serde_json::from_slice(bytes)?))
}

fn decode_change(bytes: &[u8]) -> Result<Payload> {
    Ok(Payload::Change(serde_json::from_slice(bytes)?))
}

impl Payload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Payload::Register(_) => MsgType::Register,
            Payload::Change(_) => MsgType::Change,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Payload::Register(p) => serde_json::to_vec(p)?,
            Payload::Change(p) => serde_json::to_vec(p)?,
        };
        Ok(bytes)
    }

    /// Decode `bytes` with the decoder registered for `msg_type`.
    pub fn decode(msg_type: u32, bytes: &[u8]) -> Result<Self> {
        let decode = DECODERS
            .iter()
            .find(|(t, _)| t.as_u32() == msg_type)
            .map(|(_, d)| *d)
            .ok_or(CodecError::UnknownType(msg_type))?;
        decode(bytes)
    }
}

impl From<Register> for Payload {
    fn from(p: Register) -> Self {
        Payload::Register(p)
    }
}

impl From<Change> for Payload {
    fn from(p: Change) -> Self {
        Payload::Change(p)
    }
}
