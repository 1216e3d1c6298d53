//! The file sync service: one context object tying storage, configuration
//! and transports together

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::apply::{self, process_zip};
use super::router::route_changes;
use super::run_blocking;
use super::status::{RemoteNodeStatus, RemoteNodeStatuses};
use super::writer::{DataWriter, ZipBatchWriter};
use crate::error::{FileSyncError, Result};
use crate::snapshot::{DirectorySnapshot, FileTriggerTracker};
use crate::storage::{nodes, outgoing, snapshots, triggers, Storage};
use crate::transport::{
    acks_for, build_ack, parse_ack, BatchAck, OfflineTransportManager, OutgoingTransport,
    TransportManager, TransportStatus,
};
use crate::types::{
    BatchStatus, CommunicationType, FileSyncConfig, FileTriggerRouter, Node, OutgoingBatch,
    CHANNEL_FILESYNC, CHANNEL_FILESYNC_RELOAD,
};

const OUTGOING_DIR: &str = "filesync_outgoing";
const ARCHIVE_NAME: &str = "filesync.zip";

type RuleKey = (String, String);

/// Outcome of one tracking cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSummary {
    pub rules_tracked: usize,
    pub changes: usize,
    pub bytes: u64,
    pub batches_routed: usize,
}

/// Drives change tracking, push and pull for the local node
pub struct FileSyncService {
    storage: Storage,
    config: FileSyncConfig,
    transport: Arc<dyn TransportManager>,
    offline: OfflineTransportManager,
    trackers: Mutex<HashMap<RuleKey, FileTriggerTracker>>,
}

impl FileSyncService {
    /// Create the service and register the local node
    pub fn new(
        storage: Storage,
        config: FileSyncConfig,
        transport: Arc<dyn TransportManager>,
    ) -> Result<Self> {
        config.validate()?;
        let offline = OfflineTransportManager::from_config(&config);
        let service = Self {
            storage,
            config,
            transport,
            offline,
            trackers: Mutex::new(HashMap::new()),
        };
        let local = service.local_node();
        service
            .storage
            .with_connection(|conn| match nodes::get_node(conn, &local.node_id)? {
                Some(_) => Ok(()),
                None => nodes::save_node(conn, &local),
            })?;
        Ok(service)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &FileSyncConfig {
        &self.config
    }

    /// This node as peers see it
    pub fn local_node(&self) -> Node {
        Node::new(
            self.config.identity.node_id.clone(),
            self.config.identity.node_group_id.clone(),
        )
    }

    fn transport_manager(&self) -> &dyn TransportManager {
        if self.config.node_offline {
            &self.offline
        } else {
            self.transport.as_ref()
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Save a rule with its trigger and router; the cached tracker is dropped
    pub fn save_rule(&self, rule: &FileTriggerRouter) -> Result<()> {
        self.storage
            .with_transaction(|conn| triggers::save_rule(conn, rule))?;
        self.trackers
            .lock()
            .remove(&(rule.trigger_id().to_string(), rule.router_id().to_string()));
        Ok(())
    }

    /// Rules whose router sends from this node's group
    pub fn get_file_trigger_routers_for_current_node(&self) -> Result<Vec<FileTriggerRouter>> {
        let group = self.config.identity.node_group_id.clone();
        self.storage.with_connection(|conn| {
            triggers::get_file_trigger_routers_for_source_group(conn, &group)
        })
    }

    // =========================================================================
    // Change tracking
    // =========================================================================

    /// Walk every enabled rule, persist what changed and route it to target nodes.
    ///
    /// Each rule is saved in its own transaction. When saving fails the rule's
    /// cached snapshot is discarded so the next cycle diffs against the ledger
    /// again; the first such error is returned after the other rules ran.
    pub fn track_changes(&self) -> Result<TrackSummary> {
        let rules = self.get_file_trigger_routers_for_current_node()?;
        let local_node_id = self.config.identity.node_id.clone();
        let mut summary = TrackSummary::default();
        let mut first_error = None;

        for rule in rules.into_iter().filter(|r| r.enabled) {
            let key = (rule.trigger_id().to_string(), rule.router_id().to_string());
            let base_dir = self.config.expand_path(&rule.trigger.base_dir);

            let result = self.track_rule(&key, &rule, &base_dir).and_then(|mut changes| {
                if changes.is_empty() {
                    return Ok((0, 0, 0));
                }
                self.storage.with_transaction(|conn| {
                    let bytes = snapshots::save_directory_snapshot(
                        conn,
                        &mut changes,
                        &base_dir,
                        self.config.prevent_ping_back,
                    )?;
                    let batches = route_changes(conn, &local_node_id, &rule, &changes)?;
                    Ok((changes.len(), bytes, batches.len()))
                })
            });

            summary.rules_tracked += 1;
            match result {
                Ok((changes, bytes, batches)) => {
                    summary.changes += changes;
                    summary.bytes += bytes;
                    summary.batches_routed += batches;
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to track changes for {}::{}: {}",
                        key.0,
                        key.1,
                        e
                    );
                    self.trackers.lock().remove(&key);
                    first_error.get_or_insert(e);
                }
            }
        }

        if summary.changes > 0 {
            tracing::info!(
                "Captured {} changes ({} bytes) in {} batches",
                summary.changes,
                summary.bytes,
                summary.batches_routed
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn track_rule(
        &self,
        key: &RuleKey,
        rule: &FileTriggerRouter,
        base_dir: &str,
    ) -> Result<DirectorySnapshot> {
        let mut trackers = self.trackers.lock();
        let stale = trackers.get(key).map_or(true, |t| t.rule() != rule);
        if stale {
            let last = self
                .storage
                .with_connection(|conn| snapshots::get_directory_snapshot(conn, rule))?;
            let tracker =
                FileTriggerTracker::new(rule.clone(), base_dir, last, self.config.use_crc)?;
            trackers.insert(key.clone(), tracker);
        }
        match trackers.get_mut(key) {
            Some(tracker) => tracker.track_changes(),
            None => Err(FileSyncError::Internal(format!(
                "tracker for {}::{} vanished",
                key.0, key.1
            ))),
        }
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Send pending batches to every node this node pushes to
    pub async fn push_files_to_nodes(&self) -> Result<RemoteNodeStatuses> {
        let communication = if self.config.node_offline {
            CommunicationType::OfflineFilePush
        } else {
            CommunicationType::FilePush
        };
        let remotes = self.nodes_to_communicate_with(communication)?;

        let mut statuses = RemoteNodeStatuses::new();
        for remote in remotes {
            let status = statuses.add(&remote.node_id);
            if let Err(e) = self.push_files_to_node(&remote, status).await {
                if e.is_retryable() {
                    tracing::warn!("Push to {} failed, will retry: {}", remote.node_id, e);
                } else {
                    tracing::error!("Push to {} failed: {}", remote.node_id, e);
                }
                status.fail(&e);
            }
        }
        Ok(statuses)
    }

    pub async fn push_files_to_node(
        &self,
        remote: &Node,
        status: &mut RemoteNodeStatus,
    ) -> Result<()> {
        let local = self.local_node();
        let identity = &self.config.identity;
        let mut transport = self.transport_manager().push_transport(
            remote,
            &local,
            &identity.password,
            &identity.registration_url,
        )?;

        let Some((batches, ack)) = self.send_files(remote, transport.as_mut()).await? else {
            return Ok(());
        };

        let acks = self.apply_acks(&remote.node_id, &ack)?;
        status.update_outgoing_status(&batches, &acks);
        tracing::info!(
            "Pushed {} batches to {} ({} acknowledged)",
            batches.len(),
            remote.node_id,
            acks.len()
        );
        Ok(())
    }

    /// Package pending batches for `remote` and hand them to `transport`.
    ///
    /// Returns the batches sent and the acknowledgment payload, or `None`
    /// when nothing was pending (the transport is not called at all). A
    /// transport that cannot report outcomes counts every batch as OK.
    pub async fn send_files(
        &self,
        remote: &Node,
        transport: &mut dyn OutgoingTransport,
    ) -> Result<Option<(Vec<OutgoingBatch>, String)>> {
        let archive = self.outgoing_archive(&remote.node_id);
        let batches = {
            let storage = self.storage.clone();
            let config = self.config.clone();
            let remote = remote.clone();
            let archive = archive.clone();
            run_blocking(move || {
                // staging for this node only ever holds the archive being sent
                if let Some(parent) = archive.parent() {
                    if parent.exists() {
                        std::fs::remove_dir_all(parent)?;
                    }
                }
                extract_batches(&storage, &config, &remote, &archive)
            })
            .await?
        };
        if batches.is_empty() {
            return Ok(None);
        }

        let ack = match transport.process(&archive).await? {
            Some(payload) => payload,
            None => build_ack(
                &batches
                    .iter()
                    .map(|b| BatchAck::ok(b.batch_id))
                    .collect::<Vec<_>>(),
            ),
        };
        Ok(Some((batches, ack)))
    }

    /// Build an archive of pending batches for a node that pulls from us.
    ///
    /// Returns the batches written; none means no archive was produced.
    /// This blocks on the archive and the ledger, so async callers should run
    /// it on a blocking thread.
    pub fn extract_files_for_pull(
        &self,
        remote_node_id: &str,
        archive: &Path,
    ) -> Result<Vec<OutgoingBatch>> {
        let remote = self
            .storage
            .with_connection(|conn| nodes::get_node(conn, remote_node_id))?
            .ok_or_else(|| FileSyncError::NotFound(format!("node {}", remote_node_id)))?;
        extract_batches(&self.storage, &self.config, &remote, archive)
    }

    /// Apply an acknowledgment payload from `remote_node_id` to outgoing batches
    pub fn apply_acks(&self, remote_node_id: &str, payload: &str) -> Result<Vec<BatchAck>> {
        let acks = parse_ack(payload);
        self.storage.with_transaction(|conn| {
            for ack in &acks {
                let (status, message) = match &ack.error {
                    None => (BatchStatus::Ok, None),
                    Some(message) => (BatchStatus::Error, Some(message.as_str())),
                };
                let updated = outgoing::update_outgoing_batch_status(
                    conn,
                    remote_node_id,
                    ack.batch_id,
                    status,
                    message,
                )?;
                if !updated {
                    tracing::warn!(
                        "Acknowledgment for unknown batch {} from {}",
                        ack.batch_id,
                        remote_node_id
                    );
                }
            }
            Ok(())
        })?;
        Ok(acks)
    }

    fn outgoing_archive(&self, remote_node_id: &str) -> PathBuf {
        self.config
            .staging_path()
            .join(OUTGOING_DIR)
            .join(remote_node_id)
            .join(ARCHIVE_NAME)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Fetch and apply archives from every node this node pulls from
    pub async fn pull_files_from_nodes(&self) -> Result<RemoteNodeStatuses> {
        let communication = if self.config.node_offline {
            CommunicationType::OfflineFilePull
        } else {
            CommunicationType::FilePull
        };
        let remotes = self.nodes_to_communicate_with(communication)?;

        let mut statuses = RemoteNodeStatuses::new();
        for remote in remotes {
            let status = statuses.add(&remote.node_id);
            if let Err(e) = self.pull_files_from_node(&remote, status).await {
                if e.is_retryable() {
                    tracing::warn!("Pull from {} failed, will retry: {}", remote.node_id, e);
                } else {
                    tracing::error!("Pull from {} failed: {}", remote.node_id, e);
                }
                status.fail(&e);
            }
        }
        Ok(statuses)
    }

    pub async fn pull_files_from_node(
        &self,
        remote: &Node,
        status: &mut RemoteNodeStatus,
    ) -> Result<()> {
        let local = self.local_node();
        let identity = &self.config.identity;
        let manager = self.transport_manager();
        let mut transport = manager.pull_transport(
            remote,
            &local,
            &identity.password,
            &identity.registration_url,
        )?;

        let archive = apply::incoming_dir(&self.config)
            .join(&remote.node_id)
            .join(ARCHIVE_NAME);
        match transport.process(&archive).await? {
            TransportStatus::Unavailable => {
                tracing::debug!("Nothing to pull from {}", remote.node_id);
                return Ok(());
            }
            TransportStatus::Ok => {}
        }

        let batches = match process_zip(&self.storage, &self.config, &archive, &remote.node_id)
            .await
        {
            Ok(batches) => batches,
            Err(e) => {
                transport.complete(false).await?;
                return Err(e);
            }
        };
        if let Err(e) = std::fs::remove_file(&archive) {
            tracing::warn!("Could not remove {}: {}", archive.display(), e);
        }

        let success = batches.iter().all(|b| b.status != BatchStatus::Error);
        transport.complete(success).await?;
        status.update_incoming_status(&batches);

        if let Err(e) = apply::clean_extract_dir(&self.config) {
            tracing::warn!("Could not purge extraction directories: {}", e);
        }
        if !batches.is_empty() && !self.config.node_offline {
            manager
                .send_acknowledgement(
                    remote,
                    &local,
                    &identity.password,
                    &identity.registration_url,
                    &batches,
                )
                .await?;
        }
        Ok(())
    }

    /// Apply an archive a peer pushed to us and return the acknowledgment payload
    pub async fn load_files_from_push(
        &self,
        source_node_id: &str,
        archive: &Path,
    ) -> Result<String> {
        let batches = process_zip(&self.storage, &self.config, archive, source_node_id).await?;
        if let Err(e) = apply::clean_extract_dir(&self.config) {
            tracing::warn!("Could not purge extraction directories: {}", e);
        }
        Ok(build_ack(&acks_for(&batches)))
    }

    // =========================================================================
    // Reload
    // =========================================================================

    /// Queue a full resend of every rule routed to `node_id`, one batch per rule
    pub fn queue_reload(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let node = self
            .storage
            .with_connection(|conn| nodes::get_node(conn, node_id))?
            .ok_or_else(|| FileSyncError::NotFound(format!("node {}", node_id)))?;
        let rules: Vec<FileTriggerRouter> = self
            .get_file_trigger_routers_for_current_node()?
            .into_iter()
            .filter(|rule| {
                rule.enabled
                    && rule.initial_load_enabled
                    && rule.router.target_node_group_id == node.node_group_id
            })
            .collect();
        if rules.is_empty() {
            tracing::warn!("No file triggers route to {}, nothing to reload", node_id);
            return Ok(Vec::new());
        }

        let batches = self
            .storage
            .with_transaction(|conn| outgoing::queue_reload(conn, node_id, &rules))?;
        tracing::info!("Queued {} reload batches for {}", batches.len(), node_id);
        Ok(batches)
    }

    /// Remove stale extraction directories
    pub fn clean_extract_dir(&self) -> Result<usize> {
        apply::clean_extract_dir(&self.config)
    }

    fn nodes_to_communicate_with(&self, communication: CommunicationType) -> Result<Vec<Node>> {
        let identity = &self.config.identity;
        self.storage.with_connection(|conn| {
            nodes::get_nodes_to_communicate_with(
                conn,
                &identity.node_id,
                &identity.node_group_id,
                communication,
            )
        })
    }
}

/// Write pending batches for `remote` into `archive`, marking them as sending
fn extract_batches(
    storage: &Storage,
    config: &FileSyncConfig,
    remote: &Node,
    archive: &Path,
) -> Result<Vec<OutgoingBatch>> {
    let pending = storage.with_connection(|conn| {
        outgoing::get_pending_outgoing_batches(
            conn,
            &remote.node_id,
            &[CHANNEL_FILESYNC, CHANNEL_FILESYNC_RELOAD],
        )
    })?;
    if pending.is_empty() {
        tracing::debug!("No pending batches for {}", remote.node_id);
        return Ok(Vec::new());
    }

    let mut writer = ZipBatchWriter::new(archive, storage.clone(), config.clone(), remote.clone());
    writer.open()?;
    for batch in pending {
        if writer.ready_to_send() {
            break;
        }
        let mut batch = batch;
        let events = storage.with_connection(|conn| {
            outgoing::update_outgoing_batch_status(
                conn,
                &remote.node_id,
                batch.batch_id,
                BatchStatus::Sending,
                None,
            )?;
            outgoing::get_outgoing_batch_events(conn, &batch)
        })?;
        batch.status = BatchStatus::Sending;

        writer.start_batch(&batch)?;
        for event in &events {
            writer.write(event)?;
        }
        writer.end_batch(&batch)?;
    }
    writer.close()?;

    Ok(writer.batches_written().to_vec())
}
