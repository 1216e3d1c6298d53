//! Background worker running tracking, push and pull on a schedule

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::service::FileSyncService;
use crate::error::{FileSyncError, Result};

/// Commands for the file sync worker
#[derive(Debug)]
pub enum FileSyncCommand {
    /// Capture changes now
    TrackNow,
    /// Send pending batches now
    PushNow,
    /// Fetch from peers now
    PullNow,
    /// Queue a full resend for a node
    Reload(String),
    /// Run a last track and push, then stop
    Stop,
}

/// Background file sync worker
pub struct FileSyncWorker {
    sender: mpsc::Sender<FileSyncCommand>,
    handle: JoinHandle<()>,
}

impl FileSyncWorker {
    /// Start the worker with the periods from the service's schedule
    pub fn start(service: Arc<FileSyncService>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<FileSyncCommand>(100);
        let schedule = service.config().schedule.clone();

        let handle = tokio::spawn(async move {
            let mut track = schedule_interval(schedule.track_interval_ms);
            let mut push = schedule_interval(schedule.push_interval_ms);
            let mut pull = schedule_interval(schedule.pull_interval_ms);

            tracing::info!("File sync worker started");
            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(FileSyncCommand::TrackNow) => Self::do_track(&service).await,
                            Some(FileSyncCommand::PushNow) => Self::do_push(&service).await,
                            Some(FileSyncCommand::PullNow) => Self::do_pull(&service).await,
                            Some(FileSyncCommand::Reload(node_id)) => {
                                if let Err(e) = service.queue_reload(&node_id) {
                                    tracing::error!("Reload for {} failed: {}", node_id, e);
                                }
                            }
                            Some(FileSyncCommand::Stop) | None => {
                                // Final cycle before stopping
                                Self::do_track(&service).await;
                                Self::do_push(&service).await;
                                break;
                            }
                        }
                    }
                    _ = tick(&mut track) => Self::do_track(&service).await,
                    _ = tick(&mut push) => Self::do_push(&service).await,
                    _ = tick(&mut pull) => Self::do_pull(&service).await,
                }
            }

            tracing::info!("File sync worker stopped");
        });

        Self { sender, handle }
    }

    async fn do_track(service: &Arc<FileSyncService>) {
        let service = Arc::clone(service);
        match tokio::task::spawn_blocking(move || service.track_changes()).await {
            Ok(Ok(summary)) => {
                tracing::debug!(
                    "Tracked {} rules: {} changes",
                    summary.rules_tracked,
                    summary.changes
                );
            }
            Ok(Err(e)) => tracing::error!("Change tracking failed: {}", e),
            Err(e) => tracing::error!("Change tracking task panicked: {}", e),
        }
    }

    async fn do_push(service: &FileSyncService) {
        match service.push_files_to_nodes().await {
            Ok(statuses) => {
                for status in statuses.iter().filter(|s| s.failed) {
                    tracing::warn!(
                        "Push to {} failed: {}",
                        status.node_id,
                        status.failure_message.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Err(e) => tracing::error!("Push cycle failed: {}", e),
        }
    }

    async fn do_pull(service: &FileSyncService) {
        match service.pull_files_from_nodes().await {
            Ok(statuses) => {
                for status in statuses.iter().filter(|s| s.failed) {
                    tracing::warn!(
                        "Pull from {} failed: {}",
                        status.node_id,
                        status.failure_message.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Err(e) => tracing::error!("Pull cycle failed: {}", e),
        }
    }

    async fn send(&self, cmd: FileSyncCommand) -> Result<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| FileSyncError::Internal("Worker channel closed".to_string()))
    }

    pub async fn track_now(&self) -> Result<()> {
        self.send(FileSyncCommand::TrackNow).await
    }

    pub async fn push_now(&self) -> Result<()> {
        self.send(FileSyncCommand::PushNow).await
    }

    pub async fn pull_now(&self) -> Result<()> {
        self.send(FileSyncCommand::PullNow).await
    }

    pub async fn reload(&self, node_id: impl Into<String>) -> Result<()> {
        self.send(FileSyncCommand::Reload(node_id.into())).await
    }

    /// Stop the worker and wait for its final cycle
    pub async fn stop(self) -> Result<()> {
        self.send(FileSyncCommand::Stop).await?;
        self.handle
            .await
            .map_err(|e| FileSyncError::Internal(format!("Worker task failed: {}", e)))
    }
}

/// Interval for a job period; zero disables the job
fn schedule_interval(period_ms: u64) -> Option<Interval> {
    if period_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(period_ms);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
