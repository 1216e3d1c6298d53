//! Change detection between two snapshots of the same rule

use std::collections::HashMap;

use super::{DirectorySnapshot, FileSnapshot};
use crate::error::{FileSyncError, Result};
use crate::types::LastEventType;

/// Compute the change events that turn `previous` into `current`.
///
/// - path only in `current`: Create
/// - path in both with a different size or modified time (or checksum when
///   `use_crc` is set): Modify, carrying the previous checksum as the old one
/// - path only in `previous`: Delete
///
/// Unchanged paths produce nothing.
pub fn diff(
    previous: &DirectorySnapshot,
    current: &DirectorySnapshot,
    use_crc: bool,
) -> Result<DirectorySnapshot> {
    if !previous.is_comparable(current) {
        return Err(FileSyncError::Snapshot(format!(
            "cannot diff {}::{} against {}::{}",
            previous.trigger_id, previous.router_id, current.trigger_id, current.router_id
        )));
    }

    let lookup: HashMap<String, &FileSnapshot> = previous
        .iter()
        .map(|file| (file.relative_path(), file))
        .collect();

    let mut changes = DirectorySnapshot::new(&current.trigger_id, &current.router_id);

    for file in current {
        let path = file.relative_path();
        match lookup.get(&path) {
            None => changes.insert(file.with_event(LastEventType::Create))?,
            Some(old) if is_modified(old, file, use_crc) => {
                let mut modified = file.with_event(LastEventType::Modify);
                modified.old_crc32_checksum = Some(old.crc32_checksum);
                modified.create_time = old.create_time;
                changes.insert(modified)?;
            }
            Some(_) => {}
        }
    }

    for old in previous {
        if !current.contains(&old.relative_path()) {
            changes.insert(old.with_event(LastEventType::Delete))?;
        }
    }

    Ok(changes)
}

fn is_modified(old: &FileSnapshot, new: &FileSnapshot, use_crc: bool) -> bool {
    old.file_size != new.file_size
        || old.file_modified_time != new.file_modified_time
        || (use_crc && old.crc32_checksum != new.crc32_checksum)
}
