//! Walks a watched directory and detects changes since the last snapshot

use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use super::{checksum_file, diff, DirectorySnapshot, FileSnapshot};
use crate::error::Result;
use crate::types::{FileTriggerRouter, ROOT_RELATIVE_DIR};

const CTL_SUFFIX: &str = ".ctl";

/// Include/exclude globs of a trigger.
///
/// Patterns are comma separated. A pattern matches when it matches either the
/// file name or the path relative to the base dir. Includes only apply to
/// files; excludes apply to files and directories.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl PatternFilter {
    pub fn new(includes: Option<&str>, excludes: Option<&str>) -> Result<Self> {
        Ok(Self {
            includes: build_glob_set(includes)?,
            excludes: build_glob_set(excludes)?,
        })
    }

    pub fn for_rule(rule: &FileTriggerRouter) -> Result<Self> {
        Self::new(
            rule.trigger.includes_files.as_deref(),
            rule.trigger.excludes_files.as_deref(),
        )
    }

    pub fn accepts_file(&self, relative_path: &str, file_name: &str) -> bool {
        let included = self
            .includes
            .as_ref()
            .map_or(true, |set| set.is_match(relative_path) || set.is_match(file_name));
        included && !self.is_excluded(relative_path, file_name)
    }

    pub fn accepts_dir(&self, relative_path: &str, dir_name: &str) -> bool {
        !self.is_excluded(relative_path, dir_name)
    }

    fn is_excluded(&self, relative_path: &str, name: &str) -> bool {
        self.excludes
            .as_ref()
            .is_some_and(|set| set.is_match(relative_path) || set.is_match(name))
    }
}

fn build_glob_set(patterns: Option<&str>) -> Result<Option<GlobSet>> {
    let patterns: Vec<&str> = patterns
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

/// Milliseconds since the epoch of a file's modification time
pub fn modified_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tracks one rule, remembering the last snapshot between cycles
pub struct FileTriggerTracker {
    rule: FileTriggerRouter,
    filter: PatternFilter,
    base_dir: String,
    last_snapshot: DirectorySnapshot,
    use_crc: bool,
}

impl FileTriggerTracker {
    /// `base_dir` is the rule's base dir after path expansion
    pub fn new(
        rule: FileTriggerRouter,
        base_dir: impl Into<String>,
        last_snapshot: DirectorySnapshot,
        use_crc: bool,
    ) -> Result<Self> {
        let filter = PatternFilter::for_rule(&rule)?;
        Ok(Self {
            rule,
            filter,
            base_dir: base_dir.into(),
            last_snapshot,
            use_crc,
        })
    }

    pub fn rule(&self) -> &FileTriggerRouter {
        &self.rule
    }

    pub fn last_snapshot(&self) -> &DirectorySnapshot {
        &self.last_snapshot
    }

    /// Current state of every matching entry under the base dir
    pub fn take_snapshot(&self) -> Result<DirectorySnapshot> {
        let mut snapshot = DirectorySnapshot::for_rule(&self.rule);
        let base = Path::new(&self.base_dir);

        if !base.is_dir() {
            tracing::warn!(
                "Base directory {} of file trigger {} does not exist, skipping",
                self.base_dir,
                self.rule.trigger_id()
            );
            return Ok(snapshot);
        }

        let mut walker = WalkDir::new(base).min_depth(1).follow_links(false);
        if !self.rule.trigger.recurse {
            walker = walker.max_depth(1);
        }

        let filter = &self.filter;
        let entries = walker.into_iter().filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match (relative_parts(base, entry.path()), entry.file_name().to_str()) {
                (Some((dir, name)), Some(_)) => {
                    filter.accepts_dir(&super::relative_path(&dir, &name), &name)
                }
                _ => false,
            }
        });

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.io_error().map(|io| io.kind()) != Some(ErrorKind::NotFound) {
                        tracing::warn!("Error walking {}: {}", self.base_dir, e);
                    }
                    continue;
                }
            };

            let Some((relative_dir, file_name)) = relative_parts(base, entry.path()) else {
                tracing::warn!("Skipping non UTF-8 path {}", entry.path().display());
                continue;
            };
            let relative_path = super::relative_path(&relative_dir, &file_name);

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    // removed between enumeration and stat
                    tracing::debug!("Could not stat {}: {}", relative_path, e);
                    continue;
                }
            };

            let mut file = FileSnapshot::new(&self.rule, relative_dir, file_name);

            if metadata.is_dir() {
                if !self.rule.trigger.recurse {
                    continue;
                }
                // directories only ever show up as created or deleted
                snapshot.insert(file)?;
                continue;
            }

            if !metadata.is_file() {
                continue;
            }

            if !self.filter.accepts_file(&relative_path, &file.file_name) {
                continue;
            }

            if self.rule.trigger.sync_on_ctl_file && !self.is_ready(entry.path(), &file.file_name)
            {
                continue;
            }

            file.file_size = metadata.len();
            file.file_modified_time = modified_millis(&metadata);
            if self.use_crc {
                match checksum_file(entry.path()) {
                    Ok(crc) => file.crc32_checksum = crc,
                    Err(e) => {
                        tracing::debug!("Could not checksum {}: {}", relative_path, e);
                        continue;
                    }
                }
            }
            snapshot.insert(file)?;
        }

        Ok(snapshot)
    }

    /// Diff the current state against the last snapshot and remember the new state
    pub fn track_changes(&mut self) -> Result<DirectorySnapshot> {
        // a vanished base dir (unmounted share) must not read as mass deletion
        if !Path::new(&self.base_dir).is_dir() {
            tracing::warn!(
                "Base directory {} of file trigger {} does not exist, no changes captured",
                self.base_dir,
                self.rule.trigger_id()
            );
            return Ok(DirectorySnapshot::for_rule(&self.rule));
        }
        let current = self.take_snapshot()?;
        let changes = diff(&self.last_snapshot, &current, self.use_crc)?;
        self.last_snapshot = current;
        Ok(changes)
    }

    /// Control files are never synced, and a file is only visible once its
    /// `<name>.ctl` companion exists
    fn is_ready(&self, path: &Path, file_name: &str) -> bool {
        if file_name.ends_with(CTL_SUFFIX) {
            return false;
        }
        let ctl = path.with_file_name(format!("{}{}", file_name, CTL_SUFFIX));
        ctl.is_file()
    }
}

/// Split a path under `base` into (`relative_dir`, `file_name`)
fn relative_parts(base: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(base).ok()?;
    let file_name = relative.file_name()?.to_str()?.to_string();
    let dir = match relative.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            let parts: Option<Vec<&str>> = parent
                .components()
                .map(|c| c.as_os_str().to_str())
                .collect();
            parts?.join("/")
        }
        _ => ROOT_RELATIVE_DIR.to_string(),
    };
    Some((dir, file_name))
}
