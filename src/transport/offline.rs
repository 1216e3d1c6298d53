//! File-drop transport for nodes without a network path to each other
//!
//! Archives are exchanged through shared directories. An archive from node
//! `S` for node `T` is named `S-T_<yyyyMMddHHmmssSSS>_filesync.zip`, so the
//! receiver picks up only what was meant for it. Files are written under a
//! temporary name and renamed into place, so a reader never sees a partial
//! archive.
//!
//! Collisions: an outgoing name that already exists gets `-<n>` before the
//! suffix; a consumed archive moved into the archive or error directory next
//! to an existing file of the same name gets `.<n>` appended.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use super::{IncomingTransport, OutgoingTransport, TransportManager, TransportStatus};
use crate::error::{FileSyncError, Result};
use crate::types::{FileSyncConfig, IncomingBatch, Node};

pub const ARCHIVE_SUFFIX: &str = "_filesync.zip";

/// Drop-directory transports built from the node configuration
#[derive(Debug, Clone)]
pub struct OfflineTransportManager {
    incoming_dir: PathBuf,
    outgoing_dir: PathBuf,
    archive_dir: Option<PathBuf>,
    error_dir: Option<PathBuf>,
}

impl OfflineTransportManager {
    pub fn new(
        incoming_dir: impl Into<PathBuf>,
        outgoing_dir: impl Into<PathBuf>,
        archive_dir: Option<PathBuf>,
        error_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            incoming_dir: incoming_dir.into(),
            outgoing_dir: outgoing_dir.into(),
            archive_dir,
            error_dir,
        }
    }

    /// Directories from `[offline]`, expanded; blank optional dirs count as unset
    pub fn from_config(config: &FileSyncConfig) -> Self {
        let optional = |dir: &Option<String>| {
            dir.as_deref()
                .filter(|d| !d.trim().is_empty())
                .map(|d| PathBuf::from(config.expand_path(d)))
        };
        Self::new(
            config.expand_path(&config.offline.incoming_dir),
            config.expand_path(&config.offline.outgoing_dir),
            optional(&config.offline.archive_dir),
            optional(&config.offline.error_dir),
        )
    }
}

#[async_trait]
impl TransportManager for OfflineTransportManager {
    fn push_transport(
        &self,
        remote: &Node,
        local: &Node,
        _password: &str,
        _registration_url: &str,
    ) -> Result<Box<dyn OutgoingTransport>> {
        Ok(Box::new(OfflineOutgoingTransport {
            outgoing_dir: self.outgoing_dir.clone(),
            prefix: archive_prefix(&local.node_id, &remote.node_id),
        }))
    }

    fn pull_transport(
        &self,
        remote: &Node,
        local: &Node,
        _password: &str,
        _registration_url: &str,
    ) -> Result<Box<dyn IncomingTransport>> {
        Ok(Box::new(OfflineIncomingTransport {
            incoming_dir: self.incoming_dir.clone(),
            archive_dir: self.archive_dir.clone(),
            error_dir: self.error_dir.clone(),
            prefix: archive_prefix(&remote.node_id, &local.node_id),
            picked: None,
        }))
    }

    async fn send_acknowledgement(
        &self,
        _remote: &Node,
        _local: &Node,
        _password: &str,
        _registration_url: &str,
        _batches: &[IncomingBatch],
    ) -> Result<()> {
        // nothing travels back over a file drop
        Ok(())
    }
}

fn archive_prefix(source_node_id: &str, target_node_id: &str) -> String {
    format!("{}-{}_", source_node_id, target_node_id)
}

/// Writes the archive into the outgoing drop directory
pub struct OfflineOutgoingTransport {
    outgoing_dir: PathBuf,
    prefix: String,
}

#[async_trait]
impl OutgoingTransport for OfflineOutgoingTransport {
    async fn process(&mut self, archive: &Path) -> Result<Option<String>> {
        tokio::fs::create_dir_all(&self.outgoing_dir).await?;

        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let mut target = self
            .outgoing_dir
            .join(format!("{}{}{}", self.prefix, stamp, ARCHIVE_SUFFIX));
        let mut n = 1;
        while target.exists() {
            target = self
                .outgoing_dir
                .join(format!("{}{}-{}{}", self.prefix, stamp, n, ARCHIVE_SUFFIX));
            n += 1;
        }

        let partial = target.with_extension("zip.part");
        tokio::fs::copy(archive, &partial).await?;
        tokio::fs::rename(&partial, &target).await?;

        tracing::info!("Dropped archive {}", target.display());
        Ok(None)
    }
}

/// Picks up the newest archive addressed to this node
pub struct OfflineIncomingTransport {
    incoming_dir: PathBuf,
    archive_dir: Option<PathBuf>,
    error_dir: Option<PathBuf>,
    prefix: String,
    picked: Option<PathBuf>,
}

impl OfflineIncomingTransport {
    fn newest_archive(&self) -> Result<Option<PathBuf>> {
        let entries = match std::fs::read_dir(&self.incoming_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<(String, PathBuf)> = None;
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(&self.prefix) || !name.ends_with(ARCHIVE_SUFFIX) {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            if newest.as_ref().map_or(true, |(best, _)| name > *best) {
                newest = Some((name, entry.path()));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

#[async_trait]
impl IncomingTransport for OfflineIncomingTransport {
    async fn process(&mut self, destination: &Path) -> Result<TransportStatus> {
        let Some(source) = self.newest_archive()? else {
            tracing::debug!(
                "No archive matching {}*{} in {}",
                self.prefix,
                ARCHIVE_SUFFIX,
                self.incoming_dir.display()
            );
            return Ok(TransportStatus::Unavailable);
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::copy(&source, destination).await {
            if let Some(error_dir) = &self.error_dir {
                move_into(&source, error_dir)?;
            }
            return Err(FileSyncError::Transport(format!(
                "Could not copy {}: {}",
                source.display(),
                e
            )));
        }

        tracing::info!("Picked up archive {}", source.display());
        self.picked = Some(source);
        Ok(TransportStatus::Ok)
    }

    async fn complete(&mut self, success: bool) -> Result<()> {
        let Some(source) = self.picked.take() else {
            return Ok(());
        };

        match (success, &self.archive_dir, &self.error_dir) {
            (true, Some(archive_dir), _) => {
                move_into(&source, archive_dir)?;
            }
            (true, None, _) => {
                tokio::fs::remove_file(&source).await?;
            }
            (false, _, Some(error_dir)) => {
                let moved = move_into(&source, error_dir)?;
                tracing::warn!("Moved failed archive to {}", moved.display());
            }
            (false, _, None) => {
                tracing::warn!("Leaving failed archive {} in place", source.display());
            }
        }
        Ok(())
    }
}

/// Move `file` into `dir`, appending `.<n>` when the name is taken
fn move_into(file: &Path, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let name = file
        .file_name()
        .ok_or_else(|| FileSyncError::InvalidInput(format!("not a file: {}", file.display())))?
        .to_string_lossy()
        .into_owned();

    let mut target = dir.join(&name);
    let mut n = 1;
    while target.exists() {
        target = dir.join(format!("{}.{}", name, n));
        n += 1;
    }

    if std::fs::rename(file, &target).is_err() {
        // different file system
        std::fs::copy(file, &target)?;
        std::fs::remove_file(file)?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: &Path, archive: bool, error: bool) -> OfflineTransportManager {
        OfflineTransportManager::new(
            root.join("drop"),
            root.join("drop"),
            archive.then(|| root.join("archive")),
            error.then(|| root.join("error")),
        )
    }

    fn nodes() -> (Node, Node) {
        (Node::new("corp-000", "corp"), Node::new("store-001", "store"))
    }

    #[tokio::test]
    async fn test_push_then_pull_through_drop_dir() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("out.zip");
        std::fs::write(&archive, b"zip bytes").unwrap();
        let (corp, store) = nodes();
        let manager = manager(dir.path(), true, false);

        let mut push = manager.push_transport(&store, &corp, "", "").unwrap();
        assert_eq!(push.process(&archive).await.unwrap(), None);

        let dropped: Vec<String> = std::fs::read_dir(dir.path().join("drop"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].starts_with("corp-000-store-001_"));
        assert!(dropped[0].ends_with(ARCHIVE_SUFFIX));

        let mut pull = manager.pull_transport(&corp, &store, "", "").unwrap();
        let received = dir.path().join("staging").join("in.zip");
        assert_eq!(pull.process(&received).await.unwrap(), TransportStatus::Ok);
        assert_eq!(std::fs::read(&received).unwrap(), b"zip bytes");

        pull.complete(true).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("drop")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("archive")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_pull_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let (corp, store) = nodes();
        let mut pull = manager(dir.path(), false, false)
            .pull_transport(&corp, &store, "", "")
            .unwrap();
        let status = pull.process(&dir.path().join("in.zip")).await.unwrap();
        assert_eq!(status, TransportStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_pull_ignores_archives_for_other_nodes() {
        let dir = TempDir::new().unwrap();
        let drop = dir.path().join("drop");
        std::fs::create_dir_all(&drop).unwrap();
        std::fs::write(
            drop.join("corp-000-store-002_20240101000000000_filesync.zip"),
            b"x",
        )
        .unwrap();
        let (corp, store) = nodes();

        let mut pull = manager(dir.path(), false, false)
            .pull_transport(&corp, &store, "", "")
            .unwrap();
        let status = pull.process(&dir.path().join("in.zip")).await.unwrap();
        assert_eq!(status, TransportStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_newest_archive_wins_and_failure_moves_to_error_dir() {
        let dir = TempDir::new().unwrap();
        let drop = dir.path().join("drop");
        std::fs::create_dir_all(&drop).unwrap();
        std::fs::write(
            drop.join("corp-000-store-001_20240101000000000_filesync.zip"),
            b"old",
        )
        .unwrap();
        std::fs::write(
            drop.join("corp-000-store-001_20240102000000000_filesync.zip"),
            b"new",
        )
        .unwrap();
        let (corp, store) = nodes();

        let mut pull = manager(dir.path(), false, true)
            .pull_transport(&corp, &store, "", "")
            .unwrap();
        let received = dir.path().join("in.zip");
        pull.process(&received).await.unwrap();
        assert_eq!(std::fs::read(&received).unwrap(), b"new");

        pull.complete(false).await.unwrap();
        assert!(dir
            .path()
            .join("error")
            .join("corp-000-store-001_20240102000000000_filesync.zip")
            .exists());
    }

    #[test]
    fn test_move_into_versions_collisions() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("archive");
        for _ in 0..2 {
            let file = dir.path().join("a_filesync.zip");
            std::fs::write(&file, b"x").unwrap();
            move_into(&file, &target).unwrap();
        }
        assert!(target.join("a_filesync.zip").exists());
        assert!(target.join("a_filesync.zip.1").exists());
    }
}
