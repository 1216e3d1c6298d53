//! filesync agent
//!
//! Run with: filesync-agent --config ~/.config/filesync/config.toml run

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filesync::error::{FileSyncError, Result};
use filesync::storage::{nodes, Storage};
#[cfg(feature = "http")]
use filesync::transport::HttpTransportManager;
use filesync::transport::TransportManager;
#[cfg(not(feature = "http"))]
use filesync::transport::OfflineTransportManager;
use filesync::types::*;
use filesync::{FileSyncService, FileSyncWorker};

#[derive(Parser, Debug)]
#[command(name = "filesync-agent")]
#[command(about = "Replicate watched directories between nodes")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(
        long,
        env = "FILESYNC_CONFIG",
        default_value = "~/.config/filesync/config.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Track, push and pull once, printing node statuses as JSON
    Once,
    /// Capture changes now
    Track,
    /// Send pending batches now
    Push,
    /// Fetch and apply archives now
    Pull,
    /// Queue a full resend of every rule routed to a node
    Reload {
        /// Target node id
        node_id: String,
    },
    /// Register a peer node
    AddNode {
        node_id: String,
        node_group_id: String,
        /// Base URL of the node's sync endpoint
        #[arg(long)]
        sync_url: Option<String>,
    },
    /// Link two node groups
    Link {
        source_group: String,
        target_group: String,
        /// Whether the source pushes (push) or the target pulls (pull)
        #[arg(long, default_value = "push")]
        action: String,
    },
    /// Add or replace a watch rule
    AddRule {
        trigger_id: String,
        base_dir: String,
        router_id: String,
        source_group: String,
        target_group: String,
        /// Directory at the destination (defaults to the base dir)
        #[arg(long)]
        target_dir: Option<String>,
        /// Include globs (comma-separated)
        #[arg(long)]
        includes: Option<String>,
        /// Exclude globs (comma-separated)
        #[arg(long)]
        excludes: Option<String>,
        /// Only watch the base dir itself
        #[arg(long)]
        no_recurse: bool,
        /// Wait for a <file>.ctl marker before syncing a file
        #[arg(long)]
        ctl_file: bool,
        /// source_wins, target_wins or manual
        #[arg(long, default_value = "source_wins")]
        conflict: String,
    },
    /// List watch rules of this node as JSON
    Rules,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = PathBuf::from(shellexpand::tilde(&args.config).to_string());
    let config = FileSyncConfig::load(&config_path)?;

    let db_path = config.expand_path(&config.db_path);
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage = Storage::open(&db_path)?;

    let transport = network_transport(&config)?;
    let service = Arc::new(FileSyncService::new(storage.clone(), config, transport)?);

    match args.command {
        Commands::Run => {
            let worker = FileSyncWorker::start(Arc::clone(&service));
            tracing::info!("Agent running as {}", service.config().identity.node_id);
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            worker.stop().await?;
        }
        Commands::Once => {
            let tracker = Arc::clone(&service);
            let tracked = tokio::task::spawn_blocking(move || tracker.track_changes())
                .await
                .map_err(|e| FileSyncError::Internal(e.to_string()))??;
            let pushed = service.push_files_to_nodes().await?;
            let pulled = service.pull_files_from_nodes().await?;
            let output = json!({
                "changes": tracked.changes,
                "batches_routed": tracked.batches_routed,
                "push": pushed,
                "pull": pulled,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Track => {
            let summary = service.track_changes()?;
            println!(
                "{} changes ({} bytes) in {} batches",
                summary.changes, summary.bytes, summary.batches_routed
            );
        }
        Commands::Push => {
            let statuses = service.push_files_to_nodes().await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Commands::Pull => {
            let statuses = service.pull_files_from_nodes().await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Commands::Reload { node_id } => {
            let batches = service.queue_reload(&node_id)?;
            println!("Queued {} reload batches for {}", batches.len(), node_id);
        }
        Commands::AddNode {
            node_id,
            node_group_id,
            sync_url,
        } => {
            let mut node = Node::new(node_id, node_group_id);
            node.sync_url = sync_url;
            storage.with_connection(|conn| nodes::save_node(conn, &node))?;
            println!("Saved node {}", node.node_id);
        }
        Commands::Link {
            source_group,
            target_group,
            action,
        } => {
            let action = match action.as_str() {
                "push" => DataEventAction::Push,
                "pull" => DataEventAction::WaitForPull,
                other => {
                    return Err(FileSyncError::InvalidInput(format!(
                        "Unknown link action: {}",
                        other
                    )))
                }
            };
            storage.with_connection(|conn| {
                nodes::save_node_group_link(conn, &source_group, &target_group, action)
            })?;
            println!("Linked {} -> {}", source_group, target_group);
        }
        Commands::AddRule {
            trigger_id,
            base_dir,
            router_id,
            source_group,
            target_group,
            target_dir,
            includes,
            excludes,
            no_recurse,
            ctl_file,
            conflict,
        } => {
            let mut trigger = FileTrigger::new(trigger_id, base_dir);
            trigger.recurse = !no_recurse;
            trigger.includes_files = includes;
            trigger.excludes_files = excludes;
            trigger.sync_on_ctl_file = ctl_file;

            let router = FileRouter {
                router_id,
                source_node_group_id: source_group,
                target_node_group_id: target_group,
            };

            let mut rule = FileTriggerRouter::new(trigger, router);
            rule.target_base_dir = target_dir;
            rule.conflict_strategy = conflict.parse().map_err(FileSyncError::InvalidInput)?;
            service.save_rule(&rule)?;
            println!("Saved rule {}::{}", rule.trigger_id(), rule.router_id());
        }
        Commands::Rules => {
            let rules = service.get_file_trigger_routers_for_current_node()?;
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
    }

    storage.checkpoint()?;
    Ok(())
}

#[cfg(feature = "http")]
fn network_transport(config: &FileSyncConfig) -> Result<Arc<dyn TransportManager>> {
    Ok(Arc::new(HttpTransportManager::new(config.http_timeout_secs)?))
}

#[cfg(not(feature = "http"))]
fn network_transport(config: &FileSyncConfig) -> Result<Arc<dyn TransportManager>> {
    tracing::warn!("Built without the http feature, using the file-drop transport");
    Ok(Arc::new(OfflineTransportManager::from_config(config)))
}
