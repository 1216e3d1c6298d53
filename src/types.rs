//! Core types for file sync: configuration, watch rules, nodes and batch states

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FileSyncError, Result};

/// Channel carrying captured file changes
pub const CHANNEL_FILESYNC: &str = "filesync";

/// Channel carrying full resync (reload) requests
pub const CHANNEL_FILESYNC_RELOAD: &str = "filesync_reload";

/// Relative directory used for entries directly under a rule's base dir
pub const ROOT_RELATIVE_DIR: &str = ".";

// =============================================================================
// Events
// =============================================================================

/// Last change observed for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastEventType {
    Create,
    Modify,
    Delete,
}

impl LastEventType {
    /// Single-character code used in the ledger, archive scripts and file lists
    pub fn code(&self) -> char {
        match self {
            LastEventType::Create => 'C',
            LastEventType::Modify => 'M',
            LastEventType::Delete => 'D',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LastEventType::Create => "C",
            LastEventType::Modify => "M",
            LastEventType::Delete => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "C" => Some(LastEventType::Create),
            "M" => Some(LastEventType::Modify),
            "D" => Some(LastEventType::Delete),
            _ => None,
        }
    }
}

impl std::str::FromStr for LastEventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LastEventType::from_code(s).ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// What the apply side does when the target file was changed independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Overwrite the target unconditionally
    #[default]
    SourceWins,
    /// Leave a conflicting target untouched
    TargetWins,
    /// Fail the batch so an operator can resolve it
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::SourceWins => "source_wins",
            ConflictStrategy::TargetWins => "target_wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "source_wins" => Ok(ConflictStrategy::SourceWins),
            "target_wins" => Ok(ConflictStrategy::TargetWins),
            "manual" => Ok(ConflictStrategy::Manual),
            _ => Err(format!("Unknown conflict strategy: {}", s)),
        }
    }
}

// =============================================================================
// Watch rules
// =============================================================================

/// A watched directory and what to capture from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTrigger {
    pub trigger_id: String,
    pub base_dir: String,
    #[serde(default = "default_true")]
    pub recurse: bool,
    /// Comma separated globs; empty means everything
    #[serde(default)]
    pub includes_files: Option<String>,
    #[serde(default)]
    pub excludes_files: Option<String>,
    #[serde(default = "default_true")]
    pub sync_on_create: bool,
    #[serde(default = "default_true")]
    pub sync_on_modified: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
    #[serde(default)]
    pub sync_on_ctl_file: bool,
    #[serde(default)]
    pub before_copy_script: Option<String>,
    #[serde(default)]
    pub after_copy_script: Option<String>,
    #[serde(default = "default_channel")]
    pub channel_id: String,
    #[serde(default = "default_reload_channel")]
    pub reload_channel_id: String,
    #[serde(default)]
    pub last_update_by: Option<String>,
}

impl FileTrigger {
    /// New trigger with every capture flag on
    pub fn new(trigger_id: impl Into<String>, base_dir: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            base_dir: base_dir.into(),
            recurse: true,
            includes_files: None,
            excludes_files: None,
            sync_on_create: true,
            sync_on_modified: true,
            sync_on_delete: true,
            sync_on_ctl_file: false,
            before_copy_script: None,
            after_copy_script: None,
            channel_id: CHANNEL_FILESYNC.to_string(),
            reload_channel_id: CHANNEL_FILESYNC_RELOAD.to_string(),
            last_update_by: None,
        }
    }

    /// Whether an event of this type should be routed to other nodes
    pub fn is_event_enabled(&self, event_type: LastEventType) -> bool {
        match event_type {
            LastEventType::Create => self.sync_on_create,
            LastEventType::Modify => self.sync_on_modified,
            LastEventType::Delete => self.sync_on_delete,
        }
    }
}

/// Routes changes from one node group to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRouter {
    pub router_id: String,
    pub source_node_group_id: String,
    pub target_node_group_id: String,
}

/// Pairing of a trigger with a router: one watch rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTriggerRouter {
    pub trigger: FileTrigger,
    pub router: FileRouter,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub initial_load_enabled: bool,
    /// Directory at the destination; falls back to the trigger's base dir
    #[serde(default)]
    pub target_base_dir: Option<String>,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub last_update_by: Option<String>,
}

impl FileTriggerRouter {
    pub fn new(trigger: FileTrigger, router: FileRouter) -> Self {
        Self {
            trigger,
            router,
            enabled: true,
            initial_load_enabled: true,
            target_base_dir: None,
            conflict_strategy: ConflictStrategy::default(),
            last_update_by: None,
        }
    }

    pub fn trigger_id(&self) -> &str {
        &self.trigger.trigger_id
    }

    pub fn router_id(&self) -> &str {
        &self.router.router_id
    }

    /// Target directory before path variable substitution
    pub fn raw_target_base_dir(&self) -> &str {
        match self.target_base_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => dir,
            _ => &self.trigger.base_dir,
        }
    }
}

// =============================================================================
// Nodes and batches
// =============================================================================

/// A participant in the replication topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    #[serde(default)]
    pub sync_url: Option<String>,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

impl Node {
    pub fn new(node_id: impl Into<String>, node_group_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            sync_url: None,
            sync_enabled: true,
        }
    }
}

/// How a group link moves data: pushed by the source or pulled by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEventAction {
    Push,
    WaitForPull,
}

impl DataEventAction {
    pub fn code(&self) -> &'static str {
        match self {
            DataEventAction::Push => "P",
            DataEventAction::WaitForPull => "W",
        }
    }
}

/// Kind of node communication a cycle performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationType {
    FilePush,
    FilePull,
    OfflineFilePush,
    OfflineFilePull,
}

impl CommunicationType {
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            CommunicationType::FilePush | CommunicationType::OfflineFilePush
        )
    }
}

/// Lifecycle of an outgoing or incoming batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Routed, waiting to be sent
    New,
    /// Extracted into an archive, waiting for acknowledgment
    Sending,
    /// Being applied
    Loading,
    Ok,
    Error,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NE" => Some(BatchStatus::New),
            "SE" => Some(BatchStatus::Sending),
            "LD" => Some(BatchStatus::Loading),
            "OK" => Some(BatchStatus::Ok),
            "ER" => Some(BatchStatus::Error),
            _ => None,
        }
    }
}

/// A batch received from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingBatch {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub byte_count: u64,
    pub statement_count: u64,
    pub error_flag: bool,
    /// Set by the ledger when a previously failed batch is being reapplied
    pub retry: bool,
    pub error_message: Option<String>,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl IncomingBatch {
    pub fn new(node_id: impl Into<String>, batch_id: i64, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: BatchStatus::Loading,
            byte_count: 0,
            statement_count: 0,
            error_flag: false,
            retry: false,
            error_message: None,
            last_update_time: None,
        }
    }
}

/// A batch waiting to be (or already) delivered to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub byte_count: u64,
    pub data_event_count: u64,
    pub error_flag: bool,
    pub error_message: Option<String>,
    pub create_time: DateTime<Utc>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Local node identity and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub node_id: String,
    pub node_group_id: String,
    /// Shared secret presented to peers
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub registration_url: String,
}

/// File-drop transport directories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    #[serde(default = "default_offline_incoming")]
    pub incoming_dir: String,
    #[serde(default = "default_offline_outgoing")]
    pub outgoing_dir: String,
    /// Where consumed archives go; deleted when unset
    #[serde(default)]
    pub archive_dir: Option<String>,
    /// Where archives that failed to load go; left in place when unset
    #[serde(default)]
    pub error_dir: Option<String>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            incoming_dir: default_offline_incoming(),
            outgoing_dir: default_offline_outgoing(),
            archive_dir: None,
            error_dir: None,
        }
    }
}

/// Periods of the background worker; zero disables a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_track_interval")]
    pub track_interval_ms: u64,
    #[serde(default = "default_sync_interval")]
    pub push_interval_ms: u64,
    #[serde(default = "default_sync_interval")]
    pub pull_interval_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            track_interval_ms: default_track_interval(),
            push_interval_ms: default_sync_interval(),
            pull_interval_ms: default_sync_interval(),
        }
    }
}

/// File sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Working area for outgoing archives and incoming extraction
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    pub identity: IdentityConfig,
    /// Compare CRC32 checksums when tracking (reads every file)
    #[serde(default)]
    pub use_crc: bool,
    /// Stamp changes written by incoming batches with their source node
    #[serde(default = "default_true")]
    pub prevent_ping_back: bool,
    /// Use the file-drop transport instead of the network
    #[serde(default)]
    pub node_offline: bool,
    /// Keep OK incoming batches in the ledger
    #[serde(default = "default_true")]
    pub record_ok_batches: bool,
    /// Stop adding batches to an archive once it holds this many bytes
    #[serde(default = "default_max_bytes")]
    pub max_bytes_to_sync: u64,
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    /// Age after which extraction directories are purged
    #[serde(default = "default_extract_retention")]
    pub extract_retention_secs: u64,
    /// Values for `${name}` tokens in directories
    #[serde(default)]
    pub path_variables: HashMap<String, String>,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl FileSyncConfig {
    /// Minimal configuration for a node; everything else defaulted
    pub fn new(
        node_id: impl Into<String>,
        node_group_id: impl Into<String>,
        staging_dir: impl Into<String>,
    ) -> Self {
        Self {
            db_path: default_db_path(),
            staging_dir: staging_dir.into(),
            identity: IdentityConfig {
                node_id: node_id.into(),
                node_group_id: node_group_id.into(),
                password: String::new(),
                registration_url: String::new(),
            },
            use_crc: false,
            prevent_ping_back: true,
            node_offline: false,
            record_ok_batches: true,
            max_bytes_to_sync: default_max_bytes(),
            script_timeout_secs: default_script_timeout(),
            extract_retention_secs: default_extract_retention(),
            path_variables: HashMap::new(),
            offline: OfflineConfig::default(),
            schedule: ScheduleConfig::default(),
            http_timeout_secs: default_http_timeout(),
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FileSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.node_id.trim().is_empty() {
            return Err(FileSyncError::Config("identity.node_id is required".into()));
        }
        if self.identity.node_group_id.trim().is_empty() {
            return Err(FileSyncError::Config(
                "identity.node_group_id is required".into(),
            ));
        }
        if self.staging_dir.trim().is_empty() {
            return Err(FileSyncError::Config("staging_dir is required".into()));
        }
        Ok(())
    }

    /// Expand `~` and `${name}` tokens; configured variables win over the environment
    pub fn expand_path(&self, raw: &str) -> String {
        let vars = &self.path_variables;
        let expanded = shellexpand::env_with_context_no_errors(raw, |name: &str| {
            vars.get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
        });
        shellexpand::tilde(expanded.as_ref()).into_owned()
    }

    pub fn staging_path(&self) -> PathBuf {
        PathBuf::from(self.expand_path(&self.staging_dir))
    }
}

fn default_true() -> bool {
    true
}

fn default_channel() -> String {
    CHANNEL_FILESYNC.to_string()
}

fn default_reload_channel() -> String {
    CHANNEL_FILESYNC_RELOAD.to_string()
}

fn default_db_path() -> String {
    "~/.local/share/filesync/filesync.db".to_string()
}

fn default_staging_dir() -> String {
    "~/.local/share/filesync/staging".to_string()
}

fn default_offline_incoming() -> String {
    "offline/incoming".to_string()
}

fn default_offline_outgoing() -> String {
    "offline/outgoing".to_string()
}

fn default_track_interval() -> u64 {
    60_000
}

fn default_sync_interval() -> u64 {
    60_000
}

fn default_max_bytes() -> u64 {
    1_048_576 * 100
}

fn default_script_timeout() -> u64 {
    600
}

fn default_extract_retention() -> u64 {
    24 * 60 * 60
}

fn default_http_timeout() -> u64 {
    90
}
