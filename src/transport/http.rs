//! HTTP transport against a peer's sync endpoint
//!
//! - push: `POST {sync_url}/filesync/push` with the archive as the body; the
//!   response body is the acknowledgment payload
//! - pull: `GET {sync_url}/filesync/pull`; `204` or `503` means nothing to fetch
//! - ack: `POST {sync_url}/ack` with the acknowledgment payload as a form body
//!
//! Every request carries `nodeId` and `securityToken` query parameters.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::{
    acks_for, build_ack, IncomingTransport, OutgoingTransport, TransportManager, TransportStatus,
};
use crate::error::{FileSyncError, Result};
use crate::types::{IncomingBatch, Node};

/// Network transports sharing one HTTP client
#[derive(Debug, Clone)]
pub struct HttpTransportManager {
    client: Client,
}

impl HttpTransportManager {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

/// Base URL of a node; falls back to the registration URL for nodes without one
fn sync_url(remote: &Node, registration_url: &str) -> Result<String> {
    remote
        .sync_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| Some(registration_url).filter(|u| !u.trim().is_empty()))
        .map(|u| u.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            FileSyncError::Transport(format!("No sync URL known for node {}", remote.node_id))
        })
}

#[async_trait]
impl TransportManager for HttpTransportManager {
    fn push_transport(
        &self,
        remote: &Node,
        local: &Node,
        password: &str,
        registration_url: &str,
    ) -> Result<Box<dyn OutgoingTransport>> {
        Ok(Box::new(HttpOutgoingTransport {
            client: self.client.clone(),
            url: format!("{}/filesync/push", sync_url(remote, registration_url)?),
            node_id: local.node_id.clone(),
            password: password.to_string(),
        }))
    }

    fn pull_transport(
        &self,
        remote: &Node,
        local: &Node,
        password: &str,
        registration_url: &str,
    ) -> Result<Box<dyn IncomingTransport>> {
        Ok(Box::new(HttpIncomingTransport {
            client: self.client.clone(),
            url: format!("{}/filesync/pull", sync_url(remote, registration_url)?),
            node_id: local.node_id.clone(),
            password: password.to_string(),
        }))
    }

    async fn send_acknowledgement(
        &self,
        remote: &Node,
        local: &Node,
        password: &str,
        registration_url: &str,
        batches: &[IncomingBatch],
    ) -> Result<()> {
        let acks = acks_for(batches);
        if acks.is_empty() {
            return Ok(());
        }

        let url = format!("{}/ack", sync_url(remote, registration_url)?);
        let response = self
            .client
            .post(&url)
            .query(&[("nodeId", local.node_id.as_str()), ("securityToken", password)])
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(build_ack(&acks))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FileSyncError::Transport(format!(
                "Acknowledgment to {} failed with {}",
                remote.node_id,
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct HttpOutgoingTransport {
    client: Client,
    url: String,
    node_id: String,
    password: String,
}

#[async_trait]
impl OutgoingTransport for HttpOutgoingTransport {
    async fn process(&mut self, archive: &Path) -> Result<Option<String>> {
        let body = tokio::fs::read(archive).await?;
        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("nodeId", self.node_id.as_str()),
                ("securityToken", self.password.as_str()),
            ])
            .header("Content-Type", "application/zip")
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::SERVICE_UNAVAILABLE => Err(FileSyncError::Unavailable(format!(
                "{} is busy",
                self.url
            ))),
            status if status.is_success() => {
                let text = response.text().await?;
                Ok(Some(text).filter(|t| !t.trim().is_empty()))
            }
            status => Err(FileSyncError::Transport(format!(
                "Push to {} failed with {}",
                self.url, status
            ))),
        }
    }
}

pub struct HttpIncomingTransport {
    client: Client,
    url: String,
    node_id: String,
    password: String,
}

#[async_trait]
impl IncomingTransport for HttpIncomingTransport {
    async fn process(&mut self, destination: &Path) -> Result<TransportStatus> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("nodeId", self.node_id.as_str()),
                ("securityToken", self.password.as_str()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::SERVICE_UNAVAILABLE => {
                Ok(TransportStatus::Unavailable)
            }
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(destination, &bytes).await?;
                Ok(TransportStatus::Ok)
            }
            status => Err(FileSyncError::Transport(format!(
                "Pull from {} failed with {}",
                self.url, status
            ))),
        }
    }

    async fn complete(&mut self, _success: bool) -> Result<()> {
        // the outcome travels back as an acknowledgment
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, answer 200 and return what was received
    async fn serve_once(listener: TcpListener) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&received);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if received.len() >= end + 4 + length {
                    break;
                }
            }
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&received).into_owned()
    }

    #[tokio::test]
    async fn test_ack_goes_to_registration_url_when_node_has_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registration_url = format!("http://{}/sync", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener));

        let manager = HttpTransportManager::new(5).unwrap();
        let remote = Node::new("corp-000", "corp");
        let local = Node::new("store-001", "store");
        let mut loaded = IncomingBatch::new("corp-000", 12, "filesync");
        loaded.status = BatchStatus::Ok;

        manager
            .send_acknowledgement(&remote, &local, "secret", &registration_url, &[loaded])
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /sync/ack?"), "{}", request);
        assert!(request.contains("nodeId=store-001"), "{}", request);
        assert!(request.ends_with("batch-12=ok&"), "{}", request);
    }

    #[tokio::test]
    async fn test_ack_without_any_url_fails() {
        let manager = HttpTransportManager::new(5).unwrap();
        let remote = Node::new("corp-000", "corp");
        let local = Node::new("store-001", "store");
        let mut loaded = IncomingBatch::new("corp-000", 12, "filesync");
        loaded.status = BatchStatus::Ok;

        let err = manager
            .send_acknowledgement(&remote, &local, "secret", "", &[loaded])
            .await
            .unwrap_err();
        assert!(matches!(err, FileSyncError::Transport(_)));
    }

    #[test]
    fn test_sync_url_falls_back_to_registration_url() {
        let mut node = Node::new("store-001", "store");
        assert!(sync_url(&node, "").is_err());
        assert_eq!(
            sync_url(&node, "http://corp:31415/sync/").unwrap(),
            "http://corp:31415/sync"
        );

        node.sync_url = Some("http://store-001:31415/sync".into());
        assert_eq!(
            sync_url(&node, "http://corp:31415/sync").unwrap(),
            "http://store-001:31415/sync"
        );
    }

    #[test]
    fn test_transports_need_a_url() {
        let manager = HttpTransportManager::new(5).unwrap();
        let local = Node::new("corp-000", "corp");
        let remote = Node::new("store-001", "store");
        assert!(manager.push_transport(&remote, &local, "secret", "").is_err());
        assert!(manager
            .pull_transport(&remote, &local, "secret", "http://corp:31415/sync")
            .is_ok());
    }
}
