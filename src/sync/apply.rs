//! Applying a received archive: extract, run each batch's script, record the outcome
//!
//! Work happens under the staging directory:
//!
//! ```text
//! filesync_incoming/extract/<timestamp>/<batchId>/...   unpacked archive
//! filesync_incoming/processing/<nodeId>-<batchId>/      file list and script output
//! ```
//!
//! The processing directory is removed once a batch is done. Extraction
//! directories are kept for inspection and purged by [`clean_extract_dir`].
//!
//! Unpacking and recording applied files run on the blocking pool. Acquiring
//! a batch is a single-row ledger update and runs inline.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::process::Command;
use walkdir::WalkDir;
use zip::ZipArchive;

use super::run_blocking;
use super::writer::{BATCH_INFO_FILE, SCRIPT_FILE};
use crate::error::{FileSyncError, Result};
use crate::snapshot::modified_millis;
use crate::storage::{incoming, snapshots, Storage};
use crate::types::{BatchStatus, FileSyncConfig, IncomingBatch, LastEventType, CHANNEL_FILESYNC};

const INCOMING_DIR: &str = "filesync_incoming";
const EXTRACT_DIR: &str = "extract";
const PROCESSING_DIR: &str = "processing";
const FILE_LIST: &str = "fileList.txt";
const OUTPUT_FILE: &str = "output.txt";
/// Script output kept in an error message
const MAX_OUTPUT_CHARS: usize = 2000;

pub(crate) fn incoming_dir(config: &FileSyncConfig) -> PathBuf {
    config.staging_path().join(INCOMING_DIR)
}

fn extract_root(config: &FileSyncConfig) -> PathBuf {
    incoming_dir(config).join(EXTRACT_DIR)
}

/// Apply every batch in `archive`, received from `source_node_id`.
///
/// Batches run in ascending id order. A batch that was already applied is
/// reported as OK without running again; a batch whose script fails is
/// recorded as ER and does not stop the ones after it. Errors from the
/// ledger itself abort the whole archive.
pub async fn process_zip(
    storage: &Storage,
    config: &FileSyncConfig,
    archive: &Path,
    source_node_id: &str,
) -> Result<Vec<IncomingBatch>> {
    let staged = {
        let config = config.clone();
        let archive = archive.to_path_buf();
        run_blocking(move || stage_archive(&config, &archive)).await?
    };
    tracing::info!(
        "Loading {} batches from {} ({})",
        staged.len(),
        source_node_id,
        archive.display()
    );

    let mut batches = Vec::with_capacity(staged.len());
    for staged_batch in staged {
        let StagedBatch {
            batch_id,
            dir: batch_dir,
            channel_id,
            byte_count,
        } = staged_batch;
        let mut batch = IncomingBatch::new(source_node_id, batch_id, channel_id);
        batch.byte_count = byte_count;

        let acquired =
            storage.with_transaction(|conn| incoming::acquire_incoming_batch(conn, &mut batch))?;
        if !acquired {
            tracing::info!(
                "Batch {} from {} was already loaded, skipping it",
                batch_id,
                source_node_id
            );
            batches.push(batch);
            continue;
        }

        load_batch(storage, config, &mut batch, &batch_dir).await?;
        batches.push(batch);
    }

    Ok(batches)
}

/// Run one batch's script and record how it went
async fn load_batch(
    storage: &Storage,
    config: &FileSyncConfig,
    batch: &mut IncomingBatch,
    batch_dir: &Path,
) -> Result<()> {
    let processing = ProcessingDir::create(
        incoming_dir(config)
            .join(PROCESSING_DIR)
            .join(format!("{}-{}", batch.node_id, batch.batch_id)),
    )?;
    let file_list = processing.path().join(FILE_LIST);

    let outcome = run_script(config, batch_dir, &batch.node_id, &file_list, processing.path())
        .await
        .and_then(|()| read_file_list(&file_list));

    match outcome {
        Ok(files) => {
            let storage = storage.clone();
            let prevent_ping_back = config.prevent_ping_back;
            let record_ok_batches = config.record_ok_batches;
            let mut loaded = batch.clone();
            *batch = run_blocking(move || {
                storage.with_transaction(|conn| {
                    if prevent_ping_back {
                        for (path, event) in &files {
                            record_file_incoming(conn, &loaded.node_id, path, *event)?;
                        }
                    }
                    loaded.statement_count = files.len() as u64;
                    loaded.status = BatchStatus::Ok;
                    loaded.error_flag = false;
                    loaded.error_message = None;
                    incoming::record_incoming_batch(conn, &mut loaded, record_ok_batches)
                })?;
                Ok(loaded)
            })
            .await?;
            tracing::info!(
                "Loaded batch {} from {}: {} files",
                batch.batch_id,
                batch.node_id,
                batch.statement_count
            );
        }
        Err(e) => {
            let message = match e {
                FileSyncError::Apply(message) => message,
                other => other.to_string(),
            };
            tracing::error!(
                "Failed to load batch {} from {}: {}",
                batch.batch_id,
                batch.node_id,
                message
            );
            batch.status = BatchStatus::Error;
            batch.error_flag = true;
            batch.error_message = Some(message);
            storage.with_transaction(|conn| {
                incoming::record_incoming_batch(conn, batch, config.record_ok_batches)
            })?;
        }
    }

    Ok(())
}

/// One batch directory of an unpacked archive
struct StagedBatch {
    batch_id: i64,
    dir: PathBuf,
    channel_id: String,
    byte_count: u64,
}

/// Unpack `archive` and describe its batch directories, ascending by id
fn stage_archive(config: &FileSyncConfig, archive: &Path) -> Result<Vec<StagedBatch>> {
    let extract_dir = unpack(config, archive)?;
    Ok(batch_dirs(&extract_dir)?
        .into_iter()
        .map(|(batch_id, dir)| StagedBatch {
            batch_id,
            channel_id: read_channel(&dir),
            byte_count: dir_size(&dir),
            dir,
        })
        .collect())
}

/// Unpack into a fresh timestamped extraction directory
fn unpack(config: &FileSyncConfig, archive: &Path) -> Result<PathBuf> {
    let root = extract_root(config);
    std::fs::create_dir_all(&root)?;

    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
    let mut dir = root.join(&stamp);
    let mut n = 1;
    while dir.exists() {
        dir = root.join(format!("{}-{}", stamp, n));
        n += 1;
    }
    std::fs::create_dir_all(&dir)?;

    let mut zip = ZipArchive::new(File::open(archive)?)?;
    zip.extract(&dir)?;
    Ok(dir)
}

/// Top level directories named by a batch id, ascending
fn batch_dirs(extract_dir: &Path) -> Result<Vec<(i64, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(batch_id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i64>().ok())
        else {
            tracing::warn!("Ignoring unexpected archive entry {}", entry.path().display());
            continue;
        };
        dirs.push((batch_id, entry.path()));
    }
    dirs.sort_by_key(|(id, _)| *id);
    Ok(dirs)
}

fn read_channel(batch_dir: &Path) -> String {
    std::fs::read_to_string(batch_dir.join(BATCH_INFO_FILE))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| CHANNEL_FILESYNC.to_string())
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Run `sync.sh <batchDir> <sourceNodeId> <fileList>` with path variables in
/// its environment, bounded by the configured timeout
async fn run_script(
    config: &FileSyncConfig,
    batch_dir: &Path,
    source_node_id: &str,
    file_list: &Path,
    work_dir: &Path,
) -> Result<()> {
    let script = batch_dir.join(SCRIPT_FILE);
    if !script.is_file() {
        return Err(FileSyncError::Apply(format!(
            "Missing {} in {}",
            SCRIPT_FILE,
            batch_dir.display()
        )));
    }

    let command_line = format!(
        "/bin/sh {} {} {} {}",
        script.display(),
        batch_dir.display(),
        source_node_id,
        file_list.display()
    );
    let output_path = work_dir.join(OUTPUT_FILE);
    let stdout = File::create(&output_path)?;
    let stderr = stdout.try_clone()?;

    let mut child = Command::new("/bin/sh")
        .arg(&script)
        .arg(batch_dir)
        .arg(source_node_id)
        .arg(file_list)
        .current_dir(batch_dir)
        .envs(&config.path_variables)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FileSyncError::Apply(format!("Could not run {}: {}", command_line, e)))?;

    let status = if config.script_timeout_secs == 0 {
        child.wait().await?
    } else {
        let limit = Duration::from_secs(config.script_timeout_secs);
        let waited = tokio::time::timeout(limit, child.wait()).await;
        match waited {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(FileSyncError::Apply(format!(
                    "Timed out after {}s, cmd failed: {} output: {}",
                    config.script_timeout_secs,
                    command_line,
                    read_output(&output_path)
                )));
            }
        }
    };

    if status.success() {
        tracing::debug!("{} output: {}", command_line, read_output(&output_path));
        return Ok(());
    }

    Err(FileSyncError::Apply(format!(
        "Error {}, cmd failed: {} output: {}",
        status.code().unwrap_or(-1),
        command_line,
        read_output(&output_path)
    )))
}

fn read_output(path: &Path) -> String {
    let output = std::fs::read_to_string(path).unwrap_or_default();
    let output = output.trim();
    match output.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((end, _)) => format!("{}...", &output[..end]),
        None => output.to_string(),
    }
}

/// Entries the script reports as `<targetFile>=<C|M|D>`, one per line
fn read_file_list(path: &Path) -> Result<Vec<(String, LastEventType)>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FileSyncError::Apply(format!("Missing file list {}: {}", path.display(), e))
    })?;
    Ok(parse_file_list(&content))
}

fn parse_file_list(content: &str) -> Vec<(String, LastEventType)> {
    content
        .lines()
        .filter_map(|line| {
            let (path, code) = line.rsplit_once('=')?;
            let event = LastEventType::from_code(code)?;
            let path = path.trim();
            (!path.is_empty()).then(|| (path.to_string(), event))
        })
        .collect()
}

/// Remember that `source_node_id` wrote `path`, so tracking does not send it back
fn record_file_incoming(
    conn: &rusqlite::Connection,
    source_node_id: &str,
    path: &str,
    event: LastEventType,
) -> Result<()> {
    let path = normalize(path);
    let (dir, name) = match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => return Ok(()),
    };

    // directories are tracked without a modified time
    let modified = match std::fs::metadata(&path) {
        Ok(m) if m.is_dir() => 0,
        Ok(m) => modified_millis(&m),
        Err(_) => 0,
    };

    snapshots::update_file_incoming(conn, source_node_id, &dir, &name, event, modified)
}

fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        out.push('/');
        out.push_str(segment);
    }
    if !path.starts_with('/') && !out.is_empty() {
        out.remove(0);
    }
    out
}

/// Remove extraction directories older than the retention period
pub fn clean_extract_dir(config: &FileSyncConfig) -> Result<usize> {
    let root = extract_root(config);
    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let retention = Duration::from_secs(config.extract_retention_secs);
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or_default();
        if metadata.is_dir() && age >= retention {
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!("Purged {} extraction directories", removed);
    }
    Ok(removed)
}

/// Scratch directory removed when dropped
struct ProcessingDir(PathBuf);

impl ProcessingDir {
    fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ProcessingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            tracing::warn!("Could not remove {}: {}", self.0.display(), e);
        }
    }
}
