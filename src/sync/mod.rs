//! File replication between nodes
//!
//! Tracking captures changes into the snapshot ledger and routes them into
//! outgoing batches. Pushing packs pending batches into a zip archive (see
//! [`writer`]) whose per-batch `sync.sh` (see [`script`]) reproduces the
//! changes at the destination. Pulling fetches such an archive and applies
//! it (see [`apply`]). [`FileSyncService`] drives all three;
//! [`FileSyncWorker`] runs them on a schedule.

pub mod apply;
pub mod router;
pub mod script;
pub mod service;
pub mod status;
pub mod worker;
pub mod writer;

pub use service::{FileSyncService, TrackSummary};
pub use status::{RemoteNodeStatus, RemoteNodeStatuses};
pub use worker::{FileSyncCommand, FileSyncWorker};
pub use writer::{DataWriter, ZipBatchWriter};

use crate::error::{FileSyncError, Result};

/// Run archive and ledger work on the blocking pool
pub(crate) async fn run_blocking<F, T>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FileSyncError::Internal(format!("Blocking task failed: {}", e)))?
}
