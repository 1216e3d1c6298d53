//! Moving batch archives between nodes
//!
//! A [`TransportManager`] hands out one transport per node conversation:
//! an [`OutgoingTransport`] to deliver a push archive and an
//! [`IncomingTransport`] to fetch a pull archive. Two implementations exist:
//! the file-drop [`offline`] transport and the [`http`] transport against a
//! peer's sync endpoint.

#[cfg(feature = "http")]
pub mod http;
pub mod offline;

#[cfg(feature = "http")]
pub use http::HttpTransportManager;
pub use offline::OfflineTransportManager;

use std::path::Path;

use async_trait::async_trait;
use url::form_urlencoded;

use crate::error::Result;
use crate::types::{BatchStatus, IncomingBatch, Node};

/// Outcome of asking a peer for an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// An archive was written to the destination
    Ok,
    /// Nothing to fetch right now
    Unavailable,
}

/// Delivers one archive to a peer
#[async_trait]
pub trait OutgoingTransport: Send {
    /// Hand off the archive. Returns the peer's acknowledgment payload when it
    /// answers with one; `None` when delivery is all that can be observed.
    async fn process(&mut self, archive: &Path) -> Result<Option<String>>;
}

/// Fetches one archive from a peer
#[async_trait]
pub trait IncomingTransport: Send {
    async fn process(&mut self, destination: &Path) -> Result<TransportStatus>;

    /// Called once the fetched archive was loaded; `success` is false when any
    /// batch in it failed
    async fn complete(&mut self, success: bool) -> Result<()>;
}

/// Creates transports for a (remote, local) node pair
#[async_trait]
pub trait TransportManager: Send + Sync {
    fn push_transport(
        &self,
        remote: &Node,
        local: &Node,
        password: &str,
        registration_url: &str,
    ) -> Result<Box<dyn OutgoingTransport>>;

    fn pull_transport(
        &self,
        remote: &Node,
        local: &Node,
        password: &str,
        registration_url: &str,
    ) -> Result<Box<dyn IncomingTransport>>;

    /// Report the outcome of loaded batches back to the node that sent them
    async fn send_acknowledgement(
        &self,
        remote: &Node,
        local: &Node,
        password: &str,
        registration_url: &str,
        batches: &[IncomingBatch],
    ) -> Result<()>;
}

/// One batch outcome reported by the receiving node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAck {
    pub batch_id: i64,
    /// `None` for OK, otherwise the error reported by the receiver
    pub error: Option<String>,
}

impl BatchAck {
    pub fn ok(batch_id: i64) -> Self {
        Self {
            batch_id,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

const ACK_PREFIX: &str = "batch-";
const ACK_OK: &str = "ok";

/// Encode acknowledgments as `batch-<id>=ok&batch-<id>=<error>&`
pub fn build_ack(acks: &[BatchAck]) -> String {
    let mut out = String::new();
    for ack in acks {
        out.push_str(ACK_PREFIX);
        out.push_str(&ack.batch_id.to_string());
        out.push('=');
        match &ack.error {
            None => out.push_str(ACK_OK),
            Some(error) => out.extend(form_urlencoded::byte_serialize(error.as_bytes())),
        }
        out.push('&');
    }
    out
}

/// Acknowledgments for batches that finished loading
pub fn acks_for(batches: &[IncomingBatch]) -> Vec<BatchAck> {
    batches
        .iter()
        .filter(|b| matches!(b.status, BatchStatus::Ok | BatchStatus::Error))
        .map(|b| BatchAck {
            batch_id: b.batch_id,
            error: if b.status == BatchStatus::Ok {
                None
            } else {
                Some(
                    b.error_message
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                )
            },
        })
        .collect()
}

/// Decode an acknowledgment payload; unrelated keys are ignored
pub fn parse_ack(payload: &str) -> Vec<BatchAck> {
    form_urlencoded::parse(payload.trim().as_bytes())
        .filter_map(|(key, value)| {
            let batch_id = key.strip_prefix(ACK_PREFIX)?.parse().ok()?;
            let error = if value.eq_ignore_ascii_case(ACK_OK) {
                None
            } else {
                Some(value.into_owned())
            };
            Some(BatchAck { batch_id, error })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_ok_acks() {
        let acks = vec![BatchAck::ok(1001), BatchAck::ok(1002)];
        assert_eq!(build_ack(&acks), "batch-1001=ok&batch-1002=ok&");
    }

    #[test]
    fn test_error_message_survives_round_trip() {
        let acks = vec![
            BatchAck::ok(1),
            BatchAck {
                batch_id: 2,
                error: Some("Error 1, cmd failed: a=b & c".into()),
            },
        ];
        assert_eq!(parse_ack(&build_ack(&acks)), acks);
    }

    #[test]
    fn test_parse_ignores_noise() {
        let acks = parse_ack("nodeId=store-001&batch-7=OK&batch-x=ok&");
        assert_eq!(acks, vec![BatchAck::ok(7)]);
    }

    #[test]
    fn test_acks_skip_batches_still_loading() {
        let mut ok = IncomingBatch::new("corp-000", 1, "filesync");
        ok.status = BatchStatus::Ok;
        let mut failed = IncomingBatch::new("corp-000", 2, "filesync");
        failed.status = BatchStatus::Error;
        failed.error_message = Some("Error 1".into());
        let loading = IncomingBatch::new("corp-000", 3, "filesync");

        let acks = acks_for(&[ok, failed, loading]);
        assert_eq!(acks.len(), 2);
        assert!(acks[0].is_ok());
        assert_eq!(acks[1].error.as_deref(), Some("Error 1"));
    }
}
