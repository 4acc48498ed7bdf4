//! Durable journal storage and delta sync for kit
//!
//! - [`journal`]: append-only file of messages with per-author chain checks
//! - [`cursor`]: per-peer high-water marks
//! - [`sync`]: client side of a sync round against a hub
//! - [`workspace`]: key, config and bootstrap for a journal directory

pub mod cursor;
pub mod journal;
pub mod sync;
pub mod workspace;

pub use cursor::{CursorError, CursorStore};
pub use journal::{AppendOutcome, ChainTip, Journal, JournalError};
pub use sync::{sync_tcp, sync_with_hub, SyncError, SyncReport};
pub use workspace::{Loaded, Workspace, WorkspaceConfig, WorkspaceError};
