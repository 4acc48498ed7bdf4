//! Peer identity and address

use kit_core::UserId;
use std::fmt;

/// A hub to dial: pinned identity plus network address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub id: UserId,
    pub addr: String,
}

impl PeerAddr {
    pub fn new(id: UserId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
