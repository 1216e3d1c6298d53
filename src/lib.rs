//! filesync - file replication between nodes
//!
//! Watches directories, captures what changed since the last look, and
//! replicates those changes to other nodes as zip archives carrying a small
//! shell script that reproduces them at the destination. Archives travel over
//! HTTP or through shared drop directories.

pub mod error;
pub mod snapshot;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

pub use error::{FileSyncError, Result};
pub use snapshot::{diff, DirectorySnapshot, FileSnapshot, FileTriggerTracker};
pub use storage::Storage;
pub use sync::{FileSyncService, FileSyncWorker, RemoteNodeStatus, RemoteNodeStatuses};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
