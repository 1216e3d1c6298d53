//! Per-node outcome of one push or pull cycle

use serde::Serialize;

use crate::error::FileSyncError;
use crate::transport::BatchAck;
use crate::types::{BatchStatus, IncomingBatch, OutgoingBatch, CHANNEL_FILESYNC_RELOAD};

/// What happened with one remote node during a cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteNodeStatus {
    pub node_id: String,
    pub batches_processed: u64,
    pub data_processed: u64,
    pub reload_batches_processed: u64,
    pub failed: bool,
    pub failure_message: Option<String>,
}

impl RemoteNodeStatus {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Count acknowledged outgoing batches; an error ack fails the node
    pub fn update_outgoing_status(&mut self, batches: &[OutgoingBatch], acks: &[BatchAck]) {
        for ack in acks {
            let batch = batches.iter().find(|b| b.batch_id == ack.batch_id);
            match &ack.error {
                None => {
                    self.batches_processed += 1;
                    if let Some(batch) = batch {
                        self.data_processed += batch.data_event_count;
                        if batch.channel_id == CHANNEL_FILESYNC_RELOAD {
                            self.reload_batches_processed += 1;
                        }
                    }
                }
                Some(message) => {
                    self.failed = true;
                    self.failure_message = Some(format!("Batch {}: {}", ack.batch_id, message));
                }
            }
        }
    }

    /// Count loaded incoming batches; an errored batch fails the node
    pub fn update_incoming_status(&mut self, batches: &[IncomingBatch]) {
        for batch in batches {
            match batch.status {
                BatchStatus::Ok => {
                    self.batches_processed += 1;
                    self.data_processed += batch.statement_count;
                    if batch.channel_id == CHANNEL_FILESYNC_RELOAD {
                        self.reload_batches_processed += 1;
                    }
                }
                BatchStatus::Error => {
                    self.failed = true;
                    self.failure_message = batch.error_message.clone();
                }
                _ => {}
            }
        }
    }

    pub fn fail(&mut self, error: &FileSyncError) {
        self.failed = true;
        self.failure_message = Some(error.to_string());
    }
}

/// Statuses of every node touched in a cycle, in visiting order
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RemoteNodeStatuses(Vec<RemoteNodeStatus>);

impl RemoteNodeStatuses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node_id: &str) -> &mut RemoteNodeStatus {
        self.0.push(RemoteNodeStatus::new(node_id));
        let last = self.0.len() - 1;
        &mut self.0[last]
    }

    pub fn get(&self, node_id: &str) -> Option<&RemoteNodeStatus> {
        self.0.iter().find(|s| s.node_id == node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteNodeStatus> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors_occurred(&self) -> bool {
        self.0.iter().any(|s| s.failed)
    }

    pub fn data_processed(&self) -> u64 {
        self.0.iter().map(|s| s.data_processed).sum()
    }
}
