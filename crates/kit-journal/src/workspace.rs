//! On-disk workspace: journal, signing key and config file.
//!
//! Shared by the `kit` client and the `kithub` daemon. A workspace is
//! initialised once; initialisation writes the key seed, a config file and
//! the owner's self-registration message as the first journal entry.

use crate::journal::{Journal, JournalError};
use kit_core::{CodecError, KeyPair, Message, MsgId, Payload, Register, UserId};
use kit_net::PeerAddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const KEY_FILE: &str = "key";
pub const CONFIG_FILE: &str = "config";

/// Workspace errors
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("message error: {0}")]
    Codec(#[from] CodecError),
    #[error("failed to parse config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bad hub key {0:?}: expected 64 hex characters")]
    BadHubKey(String),
    #[error("key file holds {0} bytes, expected 32")]
    BadKey(usize),
    #[error("workspace already initialized")]
    AlreadyInitialized,
    #[error("workspace not initialized")]
    NotInitialized,
    #[error("key {key} does not match journal owner {owner}")]
    KeyMismatch { key: UserId, owner: UserId },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Contents of the `config` file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Listen addresses (hub only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addrs: Vec<String>,
    /// Hub public key (hex) to address.
    #[serde(default)]
    pub hubs: BTreeMap<String, String>,
}

impl WorkspaceConfig {
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let data = fs::read(path).map_err(io_err(path))?;
        serde_json::from_slice(&data).map_err(|source| WorkspaceError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), WorkspaceError> {
        let data = serde_json::to_vec_pretty(self).map_err(|source| WorkspaceError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, data).map_err(io_err(path))
    }

    /// Parsed hub table.
    pub fn hub_peers(&self) -> Result<Vec<PeerAddr>, WorkspaceError> {
        self.hubs
            .iter()
            .map(|(key, addr)| {
                let id = UserId::from_hex(key)
                    .map_err(|_| WorkspaceError::BadHubKey(key.clone()))?;
                Ok(PeerAddr::new(id, addr.clone()))
            })
            .collect()
    }
}

/// An opened, initialised workspace.
pub struct Loaded {
    pub journal: Journal,
    pub key: KeyPair,
    pub config: WorkspaceConfig,
}

impl Loaded {
    pub fn identity(&self) -> UserId {
        self.key.user_id()
    }
}

/// Workspace rooted at a directory.
#[derive(Clone, Debug)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Create the key, config and self-registration message.
    pub fn init(
        &self,
        config: &WorkspaceConfig,
        register: Register,
    ) -> Result<Loaded, WorkspaceError> {
        let mut journal = Journal::open(&self.dir)?;
        if !journal.is_empty() {
            return Err(WorkspaceError::AlreadyInitialized);
        }

        let key = KeyPair::generate();
        let mut msg = Message::new(key.user_id(), 0, MsgId::ZERO, &Payload::from(register))?;
        msg.seal(&key)?;

        let key_path = self.key_path();
        write_key(&key_path, &key)?;
        let rest = config
            .save(&self.config_path())
            .and_then(|()| journal.append(&msg).map_err(WorkspaceError::from));
        if let Err(e) = rest {
            // a stale key would block the next init
            if let Err(re) = fs::remove_file(&key_path) {
                warn!(path = %key_path.display(), error = %re, "failed to remove key");
            }
            return Err(e);
        }

        info!(dir = %self.dir.display(), user = %key.user_id(), "workspace initialized");
        Ok(Loaded {
            journal,
            key,
            config: config.clone(),
        })
    }

    /// Open an initialised workspace and check the key owns the journal.
    pub fn open(&self) -> Result<Loaded, WorkspaceError> {
        let journal = Journal::open(&self.dir)?;
        let owner = journal.identity().ok_or(WorkspaceError::NotInitialized)?;
        let key = read_key(&self.key_path())?;
        if key.user_id() != owner {
            return Err(WorkspaceError::KeyMismatch {
                key: key.user_id(),
                owner,
            });
        }
        let config = WorkspaceConfig::load(&self.config_path())?;
        Ok(Loaded {
            journal,
            key,
            config,
        })
    }
}

fn write_key(path: &Path, key: &KeyPair) -> Result<(), WorkspaceError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o400);
    }
    let mut file = options.open(path).map_err(io_err(path))?;
    file.write_all(&key.seed())
        .and_then(|()| file.sync_all())
        .map_err(io_err(path))
}

fn read_key(path: &Path) -> Result<KeyPair, WorkspaceError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| WorkspaceError::BadKey(bytes.len()))?;
    Ok(KeyPair::from_seed(&seed))
}
