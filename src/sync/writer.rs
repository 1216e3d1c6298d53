//! Batch encoder: writes outgoing batches into one zip archive
//!
//! Layout per batch:
//!
//! ```text
//! <batchId>/<relativeDir>/<fileName>   file contents (Create/Modify)
//! <batchId>/sync.sh                    apply script
//! <batchId>/batch-info.txt             channel id
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::script::ScriptBuilder;
use crate::error::{FileSyncError, Result};
use crate::snapshot::{relative_path, FileSnapshot};
use crate::storage::{snapshots, triggers, OutgoingEvent, Storage};
use crate::types::{FileSyncConfig, FileTriggerRouter, LastEventType, Node, OutgoingBatch};

pub const SCRIPT_FILE: &str = "sync.sh";
pub const BATCH_INFO_FILE: &str = "batch-info.txt";

/// Sink for outgoing batches
pub trait DataWriter {
    fn open(&mut self) -> Result<()>;

    fn start_batch(&mut self, batch: &OutgoingBatch) -> Result<()>;

    fn write(&mut self, event: &OutgoingEvent) -> Result<()>;

    fn end_batch(&mut self, batch: &OutgoingBatch) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Whether enough has been written that no more batches should be added
    fn ready_to_send(&self) -> bool {
        false
    }
}

/// Writes batches for one target node into a zip archive
pub struct ZipBatchWriter {
    path: PathBuf,
    storage: Storage,
    config: FileSyncConfig,
    target_node: Node,
    rules: HashMap<(String, String), FileTriggerRouter>,
    zip: Option<ZipWriter<File>>,
    events: Vec<FileSnapshot>,
    /// Last event written per target path, over the life of the writer
    entries: HashMap<String, LastEventType>,
    entry_names: HashSet<String>,
    byte_count: u64,
    batches_written: Vec<OutgoingBatch>,
}

impl ZipBatchWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        storage: Storage,
        config: FileSyncConfig,
        target_node: Node,
    ) -> Self {
        Self {
            path: path.into(),
            storage,
            config,
            target_node,
            rules: HashMap::new(),
            zip: None,
            events: Vec::new(),
            entries: HashMap::new(),
            entry_names: HashSet::new(),
            byte_count: 0,
            batches_written: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of file content added so far
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Batches whose end was written, in order
    pub fn batches_written(&self) -> &[OutgoingBatch] {
        &self.batches_written
    }

    fn zip(&mut self) -> Result<&mut ZipWriter<File>> {
        self.zip
            .as_mut()
            .ok_or_else(|| FileSyncError::Internal("zip writer is not open".into()))
    }

    /// Every file of one rule, when that rule sends to the target node's group
    fn expand_reload(&mut self, trigger_id: &str, router_id: &str) -> Result<()> {
        let key = (trigger_id.to_string(), router_id.to_string());
        let Some(rule) = self.rules.get(&key) else {
            tracing::warn!(
                "Reload for unknown file trigger {} router {}, ignoring it",
                trigger_id,
                router_id
            );
            return Ok(());
        };
        if !rule.enabled
            || !rule.initial_load_enabled
            || rule.router.target_node_group_id != self.target_node.node_group_id
        {
            tracing::debug!(
                "File trigger {} router {} does not reload to {}",
                trigger_id,
                router_id,
                self.target_node.node_id
            );
            return Ok(());
        }

        let snapshot = self
            .storage
            .with_connection(|conn| snapshots::get_directory_snapshot(conn, rule))?;
        let files: Vec<FileSnapshot> = snapshot
            .into_files()
            .into_iter()
            .map(|f| f.with_event(LastEventType::Create))
            .collect();

        tracing::debug!(
            "Reload of {} for {} expands to {} files",
            trigger_id,
            self.target_node.node_id,
            files.len()
        );
        self.events.extend(files);
        Ok(())
    }

    /// Skip an event when the archive already carries it for this path
    fn is_redundant(&self, target_key: &str, event: LastEventType) -> bool {
        match self.entries.get(target_key) {
            Some(previous) => {
                *previous == event
                    || (*previous == LastEventType::Create && event == LastEventType::Modify)
            }
            None => false,
        }
    }

    fn add_file_entry(&mut self, entry_name: &str, source: &Path, is_dir: bool) -> Result<()> {
        if is_dir {
            self.zip()?.add_directory(entry_name, deflated())?;
            return Ok(());
        }

        let mut input = File::open(source)?;
        let zip = self.zip()?;
        zip.start_file(entry_name, deflated())?;
        let copied = std::io::copy(&mut input, zip)?;
        self.byte_count += copied;
        Ok(())
    }
}

impl DataWriter for ZipBatchWriter {
    fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        self.zip = Some(ZipWriter::new(file));

        let local_group = self.config.identity.node_group_id.clone();
        let rules = self.storage.with_connection(|conn| {
            triggers::get_file_trigger_routers_for_source_group(conn, &local_group)
        })?;
        self.rules = rules
            .into_iter()
            .map(|rule| {
                (
                    (rule.trigger_id().to_string(), rule.router_id().to_string()),
                    rule,
                )
            })
            .collect();
        Ok(())
    }

    fn start_batch(&mut self, _batch: &OutgoingBatch) -> Result<()> {
        self.events.clear();
        Ok(())
    }

    fn write(&mut self, event: &OutgoingEvent) -> Result<()> {
        match event {
            OutgoingEvent::File(file) => {
                self.events.push(file.clone());
                Ok(())
            }
            OutgoingEvent::Reload {
                trigger_id,
                router_id,
            } => self.expand_reload(trigger_id, router_id),
        }
    }

    fn end_batch(&mut self, batch: &OutgoingBatch) -> Result<()> {
        let mut script = ScriptBuilder::new(
            batch.batch_id,
            &self.config.identity.node_id,
            &batch.channel_id,
        );
        let events = std::mem::take(&mut self.events);

        for file in &events {
            let key = (file.trigger_id.clone(), file.router_id.clone());
            let Some(rule) = self.rules.get(&key).cloned() else {
                tracing::error!(
                    "Could not locate file trigger {} router {} for {}, ignoring the event",
                    file.trigger_id,
                    file.router_id,
                    file.relative_path()
                );
                continue;
            };

            let event = file.last_event_type.unwrap_or(LastEventType::Modify);
            let target_key = format!(
                "{}/{}",
                rule.raw_target_base_dir().trim_end_matches('/'),
                file.relative_path()
            );
            if self.is_redundant(&target_key, event) {
                continue;
            }

            if event == LastEventType::Delete {
                script.add_delete(&rule, file);
                self.entries.insert(target_key, event);
                continue;
            }

            let base_dir = self.config.expand_path(&rule.trigger.base_dir);
            let source = rule_source_path(&base_dir, file);
            let metadata = match std::fs::metadata(&source) {
                Ok(metadata) => metadata,
                Err(_) => {
                    tracing::warn!(
                        "Could not find the {} file to package for synchronization, skipping it",
                        source.display()
                    );
                    continue;
                }
            };

            let entry_name = format!(
                "{}/{}",
                batch.batch_id,
                relative_path(&file.relative_dir, &file.file_name)
            );
            if !self.entry_names.insert(entry_name.clone()) {
                return Err(FileSyncError::Snapshot(format!(
                    "Archive entry {} is written twice in batch {}",
                    entry_name, batch.batch_id
                )));
            }

            let is_dir = metadata.is_dir();
            self.add_file_entry(&entry_name, &source, is_dir)?;
            script.add_copy(&rule, file, is_dir, self.config.use_crc);
            self.entries.insert(target_key, event);
        }

        let script = script.finish();
        let zip = self.zip()?;
        zip.start_file(
            format!("{}/{}", batch.batch_id, SCRIPT_FILE),
            deflated().unix_permissions(0o755),
        )?;
        zip.write_all(script.as_bytes())?;
        zip.start_file(format!("{}/{}", batch.batch_id, BATCH_INFO_FILE), deflated())?;
        zip.write_all(batch.channel_id.as_bytes())?;

        self.batches_written.push(batch.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(zip) = self.zip.take() {
            let file = zip.finish()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn ready_to_send(&self) -> bool {
        self.byte_count >= self.config.max_bytes_to_sync
    }
}

fn deflated() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn rule_source_path(base_dir: &str, file: &FileSnapshot) -> PathBuf {
    let mut path = PathBuf::from(base_dir);
    if file.relative_dir != crate::types::ROOT_RELATIVE_DIR && !file.relative_dir.is_empty() {
        path.push(&file.relative_dir);
    }
    path.push(&file.file_name);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DirectorySnapshot;
    use crate::types::{
        BatchStatus, FileRouter, FileTrigger, CHANNEL_FILESYNC, CHANNEL_FILESYNC_RELOAD,
    };
    use chrono::Utc;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    struct Fixture {
        dir: TempDir,
        archive: PathBuf,
        storage: Storage,
        config: FileSyncConfig,
        rule: FileTriggerRouter,
    }

    fn rule_for(trigger_id: &str, base: &Path) -> FileTriggerRouter {
        FileTriggerRouter::new(
            FileTrigger::new(trigger_id, base.to_string_lossy()),
            FileRouter {
                router_id: "corp_2_store".into(),
                source_node_group_id: "corp".into(),
                target_node_group_id: "store".into(),
            },
        )
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("docs");
        std::fs::create_dir_all(base.join("sub")).unwrap();
        std::fs::write(base.join("a.txt"), b"alpha").unwrap();
        std::fs::write(base.join("sub").join("b.txt"), b"bravo").unwrap();

        let rule = rule_for("docs", &base);
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| triggers::save_rule(conn, &rule))
            .unwrap();

        let staging = dir.path().join("staging");
        let config = FileSyncConfig::new("corp-000", "corp", staging.to_string_lossy());
        let archive = dir.path().join("out.zip");
        Fixture {
            dir,
            archive,
            storage,
            config,
            rule,
        }
    }

    /// Record every file under the rule's base dir as captured
    fn capture(f: &Fixture, rule: &FileTriggerRouter, files: &[(&str, &str)]) {
        let mut changes = DirectorySnapshot::from_files(
            rule.trigger_id(),
            rule.router_id(),
            files
                .iter()
                .map(|(dir, name)| {
                    FileSnapshot::new(rule, *dir, *name).with_event(LastEventType::Create)
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let base = rule.trigger.base_dir.clone();
        f.storage
            .with_transaction(|conn| {
                snapshots::save_directory_snapshot(conn, &mut changes, &base, false)
            })
            .unwrap();
    }

    fn batch(id: i64, channel: &str) -> OutgoingBatch {
        OutgoingBatch {
            batch_id: id,
            node_id: "store-001".into(),
            channel_id: channel.into(),
            status: BatchStatus::New,
            byte_count: 0,
            data_event_count: 0,
            error_flag: false,
            error_message: None,
            create_time: Utc::now(),
        }
    }

    fn event(rule: &FileTriggerRouter, dir: &str, name: &str, ev: LastEventType) -> OutgoingEvent {
        OutgoingEvent::File(FileSnapshot::new(rule, dir, name).with_event(ev))
    }

    fn reload(rule: &FileTriggerRouter) -> OutgoingEvent {
        OutgoingEvent::Reload {
            trigger_id: rule.trigger_id().to_string(),
            router_id: rule.router_id().to_string(),
        }
    }

    fn try_write_batches(
        f: &Fixture,
        batches: Vec<(OutgoingBatch, Vec<OutgoingEvent>)>,
    ) -> Result<ZipBatchWriter> {
        let mut writer = ZipBatchWriter::new(
            &f.archive,
            f.storage.clone(),
            f.config.clone(),
            Node::new("store-001", "store"),
        );
        writer.open()?;
        for (batch, events) in batches {
            writer.start_batch(&batch)?;
            for e in &events {
                writer.write(e)?;
            }
            writer.end_batch(&batch)?;
        }
        writer.close()?;
        Ok(writer)
    }

    fn write_batches(
        f: &Fixture,
        batches: Vec<(OutgoingBatch, Vec<OutgoingEvent>)>,
    ) -> ZipBatchWriter {
        try_write_batches(f, batches).unwrap()
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn read_entry(path: &Path, name: &str) -> String {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name(name)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn test_batch_layout() {
        let f = fixture();
        let events = vec![
            event(&f.rule, ".", "a.txt", LastEventType::Create),
            event(&f.rule, "sub", "b.txt", LastEventType::Modify),
            event(&f.rule, ".", "old.txt", LastEventType::Delete),
        ];
        let writer = write_batches(&f, vec![(batch(1001, CHANNEL_FILESYNC), events)]);

        assert_eq!(
            entry_names(&f.archive),
            vec![
                "1001/a.txt",
                "1001/batch-info.txt",
                "1001/sub/b.txt",
                "1001/sync.sh",
            ]
        );
        assert_eq!(read_entry(&f.archive, "1001/batch-info.txt"), "filesync");
        assert_eq!(read_entry(&f.archive, "1001/a.txt"), "alpha");
        let script = read_entry(&f.archive, "1001/sync.sh");
        assert!(script.contains("rm -rf"));
        assert_eq!(writer.byte_count(), 10);
        assert_eq!(writer.batches_written().len(), 1);
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let f = fixture();
        let events = vec![event(&f.rule, ".", "vanished.txt", LastEventType::Create)];
        write_batches(&f, vec![(batch(1, CHANNEL_FILESYNC), events)]);

        assert_eq!(
            entry_names(&f.archive),
            vec!["1/batch-info.txt", "1/sync.sh"]
        );
        assert!(!read_entry(&f.archive, "1/sync.sh").contains("vanished.txt"));
    }

    #[test]
    fn test_modify_after_create_is_collapsed() {
        let f = fixture();
        write_batches(
            &f,
            vec![
                (
                    batch(1, CHANNEL_FILESYNC),
                    vec![event(&f.rule, ".", "a.txt", LastEventType::Create)],
                ),
                (
                    batch(2, CHANNEL_FILESYNC),
                    vec![event(&f.rule, ".", "a.txt", LastEventType::Modify)],
                ),
            ],
        );

        let names = entry_names(&f.archive);
        assert!(names.contains(&"1/a.txt".to_string()));
        assert!(!names.contains(&"2/a.txt".to_string()));
        assert!(!read_entry(&f.archive, "2/sync.sh").contains("a.txt"));
    }

    #[test]
    fn test_reload_expands_persisted_snapshot() {
        let f = fixture();
        capture(&f, &f.rule, &[(".", "a.txt"), ("sub", "b.txt")]);

        write_batches(
            &f,
            vec![(batch(5, CHANNEL_FILESYNC_RELOAD), vec![reload(&f.rule)])],
        );

        let names = entry_names(&f.archive);
        assert!(names.contains(&"5/a.txt".to_string()));
        assert!(names.contains(&"5/sub/b.txt".to_string()));
        assert_eq!(
            read_entry(&f.archive, "5/batch-info.txt"),
            "filesync_reload"
        );
    }

    #[test]
    fn test_reload_only_covers_its_own_rule() {
        let f = fixture();
        let images = f.dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("a.txt"), b"image notes").unwrap();
        let images_rule = rule_for("images", &images);
        f.storage
            .with_connection(|conn| triggers::save_rule(conn, &images_rule))
            .unwrap();
        capture(&f, &f.rule, &[(".", "a.txt")]);
        capture(&f, &images_rule, &[(".", "a.txt")]);

        write_batches(
            &f,
            vec![
                (batch(7, CHANNEL_FILESYNC_RELOAD), vec![reload(&f.rule)]),
                (batch(8, CHANNEL_FILESYNC_RELOAD), vec![reload(&images_rule)]),
            ],
        );

        assert_eq!(read_entry(&f.archive, "7/a.txt"), "alpha");
        assert_eq!(read_entry(&f.archive, "8/a.txt"), "image notes");
        assert!(read_entry(&f.archive, "8/sync.sh").contains("images"));
    }

    #[test]
    fn test_entry_written_twice_fails_the_batch() {
        let f = fixture();
        let events = vec![
            event(&f.rule, ".", "a.txt", LastEventType::Create),
            event(&f.rule, ".", "a.txt", LastEventType::Delete),
            event(&f.rule, ".", "a.txt", LastEventType::Create),
        ];
        let result = try_write_batches(&f, vec![(batch(3, CHANNEL_FILESYNC), events)]);
        assert!(matches!(result, Err(FileSyncError::Snapshot(_))));
    }

    #[test]
    fn test_ready_to_send_after_max_bytes() {
        let mut f = fixture();
        f.config.max_bytes_to_sync = 4;
        let writer = write_batches(
            &f,
            vec![(
                batch(1, CHANNEL_FILESYNC),
                vec![event(&f.rule, ".", "a.txt", LastEventType::Create)],
            )],
        );
        assert!(writer.ready_to_send());
    }
}
