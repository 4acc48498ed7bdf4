//! kit core library
//!
//! Message types, canonical encoding and cryptographic primitives for the
//! kit journal protocol.
//!
//! # Modules
//!
//! - [`types`]: identifiers, header and message
//! - [`canonical`]: fixed-width header encoding for hashing/signing
//! - [`crypto`]: keys, SHA-256 ids, network id derivation
//! - [`message`]: sealing and verification
//! - [`payload`]: typed payloads keyed by message type
//! - [`error`]: error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod message;
pub mod payload;
pub mod types;

pub use crypto::KeyPair;
pub use error::{CodecError, Result, VerifyError};
pub use payload::{Change, Payload, Register};
pub use types::*;
