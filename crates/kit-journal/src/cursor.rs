//! Per-peer cursor persistence.
//!
//! One file per remote peer, named by the peer's hex id, holding the raw
//! 32-byte id of the last message known to have reached that peer.

use kit_core::{MsgId, UserId};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cursor store errors
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("IO error on cursor for {peer}: {source}")]
    Io {
        peer: UserId,
        #[source]
        source: io::Error,
    },
    #[error("malformed cursor for {peer}: {len} bytes")]
    Malformed { peer: UserId, len: usize },
}

/// Handle to the cursor directory. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    /// Open (creating if needed) the cursor directory.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, peer: &UserId) -> PathBuf {
        self.dir.join(peer.to_hex())
    }

    /// Last message id acknowledged by `peer`, if any.
    pub fn load(&self, peer: &UserId) -> Result<Option<MsgId>, CursorError> {
        let bytes = match fs::read(self.path(peer)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CursorError::Io { peer: *peer, source }),
        };
        let id: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CursorError::Malformed {
                peer: *peer,
                len: bytes.len(),
            })?;
        Ok(Some(MsgId(id)))
    }

    /// Replace the cursor for `peer` atomically.
    pub fn store(&self, peer: &UserId, id: &MsgId) -> Result<(), CursorError> {
        let path = self.path(peer);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, id.as_bytes())
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|source| CursorError::Io { peer: *peer, source })
    }
}
