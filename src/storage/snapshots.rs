//! Snapshot ledger: the persisted last-known state of every watched file
//!
//! Each captured change is written update-then-insert so there is exactly one
//! row per (trigger, router, relative dir, file name). A Delete is recorded and
//! then the row removed, so the next snapshot no longer contains the file.
//!
//! `file_incoming` remembers which node wrote a file through an incoming
//! batch. When the tracker later sees that same file, the change is stamped
//! with that node and the router will not send it back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::snapshot::{DirectorySnapshot, FileSnapshot};
use crate::types::{FileTriggerRouter, LastEventType, ROOT_RELATIVE_DIR};

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<FileSnapshot> {
    let event: String = row.get("last_event_type")?;
    let file_size: i64 = row.get("file_size")?;
    Ok(FileSnapshot {
        trigger_id: row.get("trigger_id")?,
        router_id: row.get("router_id")?,
        relative_dir: row.get("relative_dir")?,
        file_name: row.get("file_name")?,
        last_event_type: LastEventType::from_code(&event),
        crc32_checksum: row.get("crc32_checksum")?,
        old_crc32_checksum: row.get("old_crc32_checksum")?,
        file_size: file_size.max(0) as u64,
        file_modified_time: row.get("file_modified_time")?,
        create_time: parse_time(row.get("create_time")?),
        last_update_time: parse_time(row.get("last_update_time")?),
        last_update_by: row.get("last_update_by")?,
        channel_id: row.get("channel_id")?,
        reload_channel_id: row.get("reload_channel_id")?,
    })
}

/// Directory of a file as recorded in `file_incoming`
pub fn absolute_dir(base_dir: &str, relative_dir: &str) -> String {
    let base = base_dir.trim_end_matches('/');
    let base = if base.is_empty() && base_dir.starts_with('/') {
        "/"
    } else {
        base
    };
    if relative_dir == ROOT_RELATIVE_DIR || relative_dir.is_empty() {
        base.to_string()
    } else if base == "/" {
        format!("/{}", relative_dir)
    } else {
        format!("{}/{}", base, relative_dir)
    }
}

/// Last persisted snapshot of a rule
pub fn get_directory_snapshot(
    conn: &Connection,
    rule: &FileTriggerRouter,
) -> Result<DirectorySnapshot> {
    let mut stmt = conn.prepare(
        "SELECT * FROM file_snapshot WHERE trigger_id = ? AND router_id = ?
         ORDER BY relative_dir, file_name",
    )?;
    let files = stmt
        .query_map(params![rule.trigger_id(), rule.router_id()], snapshot_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    DirectorySnapshot::from_files(rule.trigger_id(), rule.router_id(), files)
}

/// Persist captured changes and return the number of bytes they cover.
///
/// `base_dir` is the rule's expanded base dir, used to match entries against
/// `file_incoming`. Runs on the caller's connection; wrap it in a transaction
/// so a failure leaves the ledger untouched.
pub fn save_directory_snapshot(
    conn: &Connection,
    changes: &mut DirectorySnapshot,
    base_dir: &str,
    prevent_ping_back: bool,
) -> Result<u64> {
    let mut total_bytes = 0;

    for file in changes.iter_mut() {
        file.last_update_by = if prevent_ping_back {
            find_source_node_id_from_file_incoming(
                conn,
                &absolute_dir(base_dir, &file.relative_dir),
                &file.file_name,
                file.last_event_type,
                file.file_modified_time,
            )?
        } else {
            None
        };

        tracing::debug!(
            "Captured change {} {}",
            file.last_event_type.map(|e| e.as_str()).unwrap_or("?"),
            file.relative_path()
        );
        total_bytes += file.file_size;
        save_file_snapshot(conn, file)?;
    }

    Ok(total_bytes)
}

/// Update-then-insert one row; a Delete removes the row after it is written
pub fn save_file_snapshot(conn: &Connection, file: &mut FileSnapshot) -> Result<()> {
    let now = Utc::now();
    file.last_update_time = Some(now);
    let event = file
        .last_event_type
        .unwrap_or(LastEventType::Modify)
        .as_str();

    let updated = conn.execute(
        "UPDATE file_snapshot SET last_event_type = ?5, crc32_checksum = ?6,
            old_crc32_checksum = ?7, file_size = ?8, file_modified_time = ?9,
            last_update_time = ?10, last_update_by = ?11, channel_id = ?12,
            reload_channel_id = ?13
         WHERE trigger_id = ?1 AND router_id = ?2 AND relative_dir = ?3 AND file_name = ?4",
        params![
            file.trigger_id,
            file.router_id,
            file.relative_dir,
            file.file_name,
            event,
            file.crc32_checksum,
            file.old_crc32_checksum,
            file.file_size as i64,
            file.file_modified_time,
            now.to_rfc3339(),
            file.last_update_by,
            file.channel_id,
            file.reload_channel_id,
        ],
    )?;

    if updated == 0 {
        let create_time = file.create_time.unwrap_or(now);
        file.create_time = Some(create_time);
        conn.execute(
            "INSERT INTO file_snapshot (trigger_id, router_id, relative_dir, file_name,
                last_event_type, crc32_checksum, old_crc32_checksum, file_size,
                file_modified_time, last_update_time, last_update_by, channel_id,
                reload_channel_id, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                file.trigger_id,
                file.router_id,
                file.relative_dir,
                file.file_name,
                event,
                file.crc32_checksum,
                file.old_crc32_checksum,
                file.file_size as i64,
                file.file_modified_time,
                now.to_rfc3339(),
                file.last_update_by,
                file.channel_id,
                file.reload_channel_id,
                create_time.to_rfc3339(),
            ],
        )?;
    }

    if file.last_event_type == Some(LastEventType::Delete) {
        conn.execute(
            "DELETE FROM file_snapshot
             WHERE trigger_id = ? AND router_id = ? AND relative_dir = ? AND file_name = ?",
            params![
                file.trigger_id,
                file.router_id,
                file.relative_dir,
                file.file_name
            ],
        )?;
    }

    Ok(())
}

/// Node that last wrote this file through an incoming batch.
///
/// Creates and modifies match on the modified time recorded after the write.
/// A delete has no modified time left, so it matches an incoming delete of the
/// same path.
pub fn find_source_node_id_from_file_incoming(
    conn: &Connection,
    dir: &str,
    file_name: &str,
    event: Option<LastEventType>,
    file_modified_time: i64,
) -> Result<Option<String>> {
    let node_id = if event == Some(LastEventType::Delete) {
        conn.query_row(
            "SELECT node_id FROM file_incoming
             WHERE relative_dir = ? AND file_name = ? AND last_event_type = 'D'",
            params![dir, file_name],
            |row| row.get(0),
        )
        .optional()?
    } else {
        conn.query_row(
            "SELECT node_id FROM file_incoming
             WHERE relative_dir = ? AND file_name = ? AND file_modified_time = ?",
            params![dir, file_name, file_modified_time],
            |row| row.get(0),
        )
        .optional()?
    };
    Ok(node_id.filter(|id: &String| !id.trim().is_empty()))
}

/// Record that `node_id` wrote `dir/file_name`
pub fn update_file_incoming(
    conn: &Connection,
    node_id: &str,
    dir: &str,
    file_name: &str,
    event: LastEventType,
    file_modified_time: i64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE file_incoming SET node_id = ?1, file_modified_time = ?2, last_event_type = ?3
         WHERE relative_dir = ?4 AND file_name = ?5",
        params![node_id, file_modified_time, event.as_str(), dir, file_name],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO file_incoming (node_id, file_modified_time, last_event_type,
                relative_dir, file_name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![node_id, file_modified_time, event.as_str(), dir, file_name],
        )?;
    }

    Ok(())
}
