//! Snapshot model: the recorded state of files under a watch rule
//!
//! A [`FileSnapshot`] describes one file (or directory) relative to the base
//! directory of a rule. A [`DirectorySnapshot`] is every such entry for one
//! rule, keyed by relative path. The same types carry change events: the
//! output of [`diff`] is a `DirectorySnapshot` whose entries have their
//! `last_event_type` set.

pub mod checksum;
mod diff;
mod tracker;

pub use checksum::{checksum_file, crc32, Crc32};
pub use diff::diff;
pub use tracker::{modified_millis, FileTriggerTracker, PatternFilter};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FileSyncError, Result};
use crate::types::{FileTriggerRouter, LastEventType, ROOT_RELATIVE_DIR};

/// State of one file under a watch rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub trigger_id: String,
    pub router_id: String,
    /// Directory relative to the rule's base dir, `.` for the base dir itself
    pub relative_dir: String,
    pub file_name: String,
    /// Unset on freshly taken snapshots; filled in by the diff
    pub last_event_type: Option<LastEventType>,
    pub crc32_checksum: u32,
    /// Checksum before the change, used to detect conflicts at the target
    pub old_crc32_checksum: Option<u32>,
    pub file_size: u64,
    /// Milliseconds since the epoch
    pub file_modified_time: i64,
    pub create_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    /// Node that produced the change; `None` means this node
    pub last_update_by: Option<String>,
    pub channel_id: String,
    pub reload_channel_id: String,
}

impl FileSnapshot {
    /// Entry for a file found under `rule`
    pub fn new(
        rule: &FileTriggerRouter,
        relative_dir: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            trigger_id: rule.trigger_id().to_string(),
            router_id: rule.router_id().to_string(),
            relative_dir: relative_dir.into(),
            file_name: file_name.into(),
            last_event_type: None,
            crc32_checksum: 0,
            old_crc32_checksum: None,
            file_size: 0,
            file_modified_time: 0,
            create_time: None,
            last_update_time: None,
            last_update_by: None,
            channel_id: rule.trigger.channel_id.clone(),
            reload_channel_id: rule.trigger.reload_channel_id.clone(),
        }
    }

    /// Path relative to the rule's base dir, `/` separated
    pub fn relative_path(&self) -> String {
        relative_path(&self.relative_dir, &self.file_name)
    }

    /// Copy of this entry carrying `event`
    pub fn with_event(&self, event: LastEventType) -> Self {
        let mut snapshot = self.clone();
        snapshot.last_event_type = Some(event);
        snapshot
    }
}

/// Join a relative dir and a file name the way snapshot keys are formed
pub fn relative_path(relative_dir: &str, file_name: &str) -> String {
    if relative_dir == ROOT_RELATIVE_DIR || relative_dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", relative_dir, file_name)
    }
}

/// All entries captured for one rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub trigger_id: String,
    pub router_id: String,
    files: BTreeMap<String, FileSnapshot>,
}

impl DirectorySnapshot {
    pub fn new(trigger_id: impl Into<String>, router_id: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            router_id: router_id.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn for_rule(rule: &FileTriggerRouter) -> Self {
        Self::new(rule.trigger_id(), rule.router_id())
    }

    /// Build from entries; every entry must belong to the same rule
    pub fn from_files(
        trigger_id: impl Into<String>,
        router_id: impl Into<String>,
        files: impl IntoIterator<Item = FileSnapshot>,
    ) -> Result<Self> {
        let mut snapshot = Self::new(trigger_id, router_id);
        for file in files {
            snapshot.insert(file)?;
        }
        Ok(snapshot)
    }

    /// Add or replace the entry at the file's relative path
    pub fn insert(&mut self, file: FileSnapshot) -> Result<()> {
        if file.trigger_id != self.trigger_id || file.router_id != self.router_id {
            return Err(FileSyncError::Snapshot(format!(
                "entry {} belongs to {}::{}, not {}::{}",
                file.relative_path(),
                file.trigger_id,
                file.router_id,
                self.trigger_id,
                self.router_id
            )));
        }
        self.files.insert(file.relative_path(), file);
        Ok(())
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileSnapshot> {
        self.files.get(relative_path)
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.files.contains_key(relative_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileSnapshot> {
        self.files.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileSnapshot> {
        self.files.values_mut()
    }

    pub fn into_files(self) -> Vec<FileSnapshot> {
        self.files.into_values().collect()
    }

    /// Only snapshots of the same rule can be diffed against each other
    pub fn is_comparable(&self, other: &DirectorySnapshot) -> bool {
        self.trigger_id == other.trigger_id && self.router_id == other.router_id
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.file_size).sum()
    }
}

impl<'a> IntoIterator for &'a DirectorySnapshot {
    type Item = &'a FileSnapshot;
    type IntoIter = std::collections::btree_map::Values<'a, String, FileSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.values()
    }
}
