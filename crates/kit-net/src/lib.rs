//! Networking primitives for the kit protocol
//!
//! This crate provides:
//! - Message framing over byte streams
//! - The hello / hello-ack handshake with sync negotiation
//! - Split reader/writer connections

pub mod conn;
pub mod framing;
pub mod handshake;
pub mod peer;

pub use conn::{Connection, MessageReader, MessageWriter};
pub use framing::{FrameError, MessageCodec};
pub use handshake::{HandshakeError, Hello, HelloAck, Session, SyncFlags, SyncParams};
pub use peer::PeerAddr;
