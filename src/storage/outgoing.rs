//! Outgoing batch ledger: routed changes waiting for delivery to a node

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::snapshot::FileSnapshot;
use crate::types::{
    BatchStatus, FileTriggerRouter, LastEventType, OutgoingBatch, CHANNEL_FILESYNC_RELOAD,
};

const RELOAD_CODE: &str = "R";

/// One event inside an outgoing batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingEvent {
    /// A captured change; the snapshot's `last_event_type` is always set
    File(FileSnapshot),
    /// Send the full current state of one rule
    Reload {
        trigger_id: String,
        router_id: String,
    },
}

impl OutgoingEvent {
    pub fn code(&self) -> &'static str {
        match self {
            OutgoingEvent::File(file) => file
                .last_event_type
                .unwrap_or(LastEventType::Modify)
                .as_str(),
            OutgoingEvent::Reload { .. } => RELOAD_CODE,
        }
    }

    pub fn byte_count(&self) -> u64 {
        match self {
            OutgoingEvent::File(file) => file.file_size,
            OutgoingEvent::Reload { .. } => 0,
        }
    }
}

fn outgoing_batch_from_row(row: &Row) -> rusqlite::Result<OutgoingBatch> {
    let status: String = row.get("status")?;
    let byte_count: i64 = row.get("byte_count")?;
    let data_event_count: i64 = row.get("data_event_count")?;
    let create_time: String = row.get("create_time")?;

    Ok(OutgoingBatch {
        batch_id: row.get("batch_id")?,
        node_id: row.get("node_id")?,
        channel_id: row.get("channel_id")?,
        status: BatchStatus::from_code(&status).unwrap_or(BatchStatus::New),
        byte_count: byte_count.max(0) as u64,
        data_event_count: data_event_count.max(0) as u64,
        error_flag: row.get::<_, i32>("error_flag")? != 0,
        error_message: row.get("error_message")?,
        create_time: DateTime::parse_from_rfc3339(&create_time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn event_from_row(row: &Row, channel_id: &str) -> rusqlite::Result<Option<OutgoingEvent>> {
    let code: String = row.get("event_type")?;
    if code == RELOAD_CODE {
        let trigger_id: Option<String> = row.get("trigger_id")?;
        let router_id: Option<String> = row.get("router_id")?;
        return Ok(trigger_id
            .zip(router_id)
            .map(|(trigger_id, router_id)| OutgoingEvent::Reload {
                trigger_id,
                router_id,
            }));
    }
    let Some(event) = LastEventType::from_code(&code) else {
        return Ok(None);
    };

    let file_size: i64 = row.get("file_size")?;
    Ok(Some(OutgoingEvent::File(FileSnapshot {
        trigger_id: row.get("trigger_id")?,
        router_id: row.get("router_id")?,
        relative_dir: row.get("relative_dir")?,
        file_name: row.get("file_name")?,
        last_event_type: Some(event),
        crc32_checksum: row.get("crc32_checksum")?,
        old_crc32_checksum: row.get("old_crc32_checksum")?,
        file_size: file_size.max(0) as u64,
        file_modified_time: row.get("file_modified_time")?,
        create_time: None,
        last_update_time: None,
        last_update_by: None,
        channel_id: channel_id.to_string(),
        reload_channel_id: CHANNEL_FILESYNC_RELOAD.to_string(),
    })))
}

/// Create a new batch holding `events`, in order
pub fn insert_outgoing_batch(
    conn: &Connection,
    node_id: &str,
    channel_id: &str,
    events: &[OutgoingEvent],
) -> Result<OutgoingBatch> {
    let now = Utc::now();
    let byte_count: u64 = events.iter().map(OutgoingEvent::byte_count).sum();

    conn.execute(
        "INSERT INTO outgoing_batch (node_id, channel_id, status, byte_count,
            data_event_count, create_time, last_update_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            node_id,
            channel_id,
            BatchStatus::New.code(),
            byte_count as i64,
            events.len() as i64,
            now.to_rfc3339(),
        ],
    )?;
    let batch_id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT INTO outgoing_batch_event (batch_id, event_seq, event_type, trigger_id,
            router_id, relative_dir, file_name, crc32_checksum, old_crc32_checksum,
            file_size, file_modified_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for (seq, event) in events.iter().enumerate() {
        match event {
            OutgoingEvent::File(file) => stmt.execute(params![
                batch_id,
                seq as i64,
                event.code(),
                file.trigger_id,
                file.router_id,
                file.relative_dir,
                file.file_name,
                file.crc32_checksum,
                file.old_crc32_checksum,
                file.file_size as i64,
                file.file_modified_time,
            ])?,
            OutgoingEvent::Reload {
                trigger_id,
                router_id,
            } => stmt.execute(params![
                batch_id,
                seq as i64,
                event.code(),
                trigger_id,
                router_id,
                None::<String>,
                None::<String>,
                0u32,
                None::<u32>,
                0i64,
                0i64,
            ])?,
        };
    }

    Ok(OutgoingBatch {
        batch_id,
        node_id: node_id.to_string(),
        channel_id: channel_id.to_string(),
        status: BatchStatus::New,
        byte_count,
        data_event_count: events.len() as u64,
        error_flag: false,
        error_message: None,
        create_time: now,
    })
}

/// Queue a full resync of `rules` to `node_id`, one batch per rule
pub fn queue_reload(
    conn: &Connection,
    node_id: &str,
    rules: &[FileTriggerRouter],
) -> Result<Vec<OutgoingBatch>> {
    rules
        .iter()
        .map(|rule| {
            let reload = OutgoingEvent::Reload {
                trigger_id: rule.trigger_id().to_string(),
                router_id: rule.router_id().to_string(),
            };
            insert_outgoing_batch(conn, node_id, CHANNEL_FILESYNC_RELOAD, &[reload])
        })
        .collect()
}

pub fn get_outgoing_batch(conn: &Connection, batch_id: i64) -> Result<Option<OutgoingBatch>> {
    let batch = conn
        .query_row(
            "SELECT * FROM outgoing_batch WHERE batch_id = ?",
            params![batch_id],
            outgoing_batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

/// Batches for `node_id` on the given channels that have not been acknowledged
/// OK, lowest id first
pub fn get_pending_outgoing_batches(
    conn: &Connection,
    node_id: &str,
    channel_ids: &[&str],
) -> Result<Vec<OutgoingBatch>> {
    if channel_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; channel_ids.len()].join(", ");
    let sql = format!(
        "SELECT b.* FROM outgoing_batch b
         INNER JOIN channel c ON c.channel_id = b.channel_id
         WHERE b.node_id = ? AND b.status != 'OK' AND c.enabled = 1
           AND b.channel_id IN ({})
         ORDER BY b.batch_id",
        placeholders
    );

    let mut args: Vec<&str> = Vec::with_capacity(channel_ids.len() + 1);
    args.push(node_id);
    args.extend_from_slice(channel_ids);

    let mut stmt = conn.prepare(&sql)?;
    let batches = stmt
        .query_map(params_from_iter(args), outgoing_batch_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(batches)
}

pub fn get_outgoing_batch_events(
    conn: &Connection,
    batch: &OutgoingBatch,
) -> Result<Vec<OutgoingEvent>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM outgoing_batch_event WHERE batch_id = ? ORDER BY event_seq",
    )?;
    let events = stmt
        .query_map(params![batch.batch_id], |row| {
            event_from_row(row, &batch.channel_id)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events.into_iter().flatten().collect())
}

/// Set the status of a batch sent to `node_id`; returns false when no such batch exists
pub fn update_outgoing_batch_status(
    conn: &Connection,
    node_id: &str,
    batch_id: i64,
    status: BatchStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE outgoing_batch SET status = ?3, error_flag = ?4, error_message = ?5,
            last_update_time = ?6
         WHERE batch_id = ?1 AND node_id = ?2",
        params![
            batch_id,
            node_id,
            status.code(),
            status == BatchStatus::Error,
            error_message,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(updated > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{FileRouter, FileTrigger, CHANNEL_FILESYNC};
    use pretty_assertions::assert_eq;

    fn rule(trigger_id: &str) -> FileTriggerRouter {
        FileTriggerRouter::new(
            FileTrigger::new(trigger_id, format!("/data/{}", trigger_id)),
            FileRouter {
                router_id: "corp_2_store".into(),
                source_node_group_id: "corp".into(),
                target_node_group_id: "store".into(),
            },
        )
    }

    fn change(name: &str, event: LastEventType) -> OutgoingEvent {
        let mut file = FileSnapshot::new(&rule("docs"), ".", name);
        file.last_event_type = Some(event);
        file.file_size = 10;
        file.old_crc32_checksum = Some(7);
        OutgoingEvent::File(file)
    }

    fn reload_one(conn: &Connection, node_id: &str) -> Result<OutgoingBatch> {
        let mut batches = queue_reload(conn, node_id, &[rule("docs")])?;
        Ok(batches.remove(0))
    }

    #[test]
    fn test_insert_and_read_events() {
        let storage = Storage::open_in_memory().unwrap();
        let events = vec![
            change("a.txt", LastEventType::Create),
            change("b.txt", LastEventType::Delete),
        ];

        let batch = storage
            .with_transaction(|conn| {
                insert_outgoing_batch(conn, "store-001", CHANNEL_FILESYNC, &events)
            })
            .unwrap();
        assert_eq!(batch.byte_count, 20);
        assert_eq!(batch.data_event_count, 2);

        let loaded = storage
            .with_connection(|conn| get_outgoing_batch_events(conn, &batch))
            .unwrap();
        assert_eq!(loaded, events);
    }

    #[test]
    fn test_pending_batches_in_id_order() {
        let storage = Storage::open_in_memory().unwrap();
        let (first, second) = storage
            .with_transaction(|conn| {
                let first = insert_outgoing_batch(
                    conn,
                    "store-001",
                    CHANNEL_FILESYNC,
                    &[change("a", LastEventType::Create)],
                )?;
                let second = reload_one(conn, "store-001")?;
                insert_outgoing_batch(
                    conn,
                    "store-002",
                    CHANNEL_FILESYNC,
                    &[change("b", LastEventType::Create)],
                )?;
                Ok((first, second))
            })
            .unwrap();

        let pending = storage
            .with_connection(|conn| {
                get_pending_outgoing_batches(
                    conn,
                    "store-001",
                    &[CHANNEL_FILESYNC, CHANNEL_FILESYNC_RELOAD],
                )
            })
            .unwrap();
        let ids: Vec<i64> = pending.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![first.batch_id, second.batch_id]);
        assert!(first.batch_id < second.batch_id);

        let only_changes = storage
            .with_connection(|conn| {
                get_pending_outgoing_batches(conn, "store-001", &[CHANNEL_FILESYNC])
            })
            .unwrap();
        assert_eq!(only_changes.len(), 1);
    }

    #[test]
    fn test_reload_queues_one_batch_per_rule() {
        let storage = Storage::open_in_memory().unwrap();
        let batches = storage
            .with_transaction(|conn| {
                queue_reload(conn, "store-001", &[rule("docs"), rule("images")])
            })
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_ne!(batches[0].batch_id, batches[1].batch_id);

        let events: Vec<Vec<OutgoingEvent>> = batches
            .iter()
            .map(|batch| {
                storage
                    .with_connection(|conn| get_outgoing_batch_events(conn, batch))
                    .unwrap()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                vec![OutgoingEvent::Reload {
                    trigger_id: "docs".into(),
                    router_id: "corp_2_store".into(),
                }],
                vec![OutgoingEvent::Reload {
                    trigger_id: "images".into(),
                    router_id: "corp_2_store".into(),
                }],
            ]
        );
    }

    #[test]
    fn test_ok_batches_are_no_longer_pending() {
        let storage = Storage::open_in_memory().unwrap();
        let batch = storage
            .with_connection(|conn| reload_one(conn, "store-001"))
            .unwrap();

        assert!(storage
            .with_connection(|conn| {
                update_outgoing_batch_status(
                    conn,
                    "store-001",
                    batch.batch_id,
                    BatchStatus::Ok,
                    None,
                )
            })
            .unwrap());
        let pending = storage
            .with_connection(|conn| {
                get_pending_outgoing_batches(conn, "store-001", &[CHANNEL_FILESYNC_RELOAD])
            })
            .unwrap();
        assert!(pending.is_empty());

        assert!(!storage
            .with_connection(|conn| {
                update_outgoing_batch_status(
                    conn,
                    "store-002",
                    batch.batch_id,
                    BatchStatus::Ok,
                    None,
                )
            })
            .unwrap());
    }

    #[test]
    fn test_error_ack_keeps_batch_pending() {
        let storage = Storage::open_in_memory().unwrap();
        let batch = storage
            .with_connection(|conn| reload_one(conn, "store-001"))
            .unwrap();
        storage
            .with_connection(|conn| {
                update_outgoing_batch_status(
                    conn,
                    "store-001",
                    batch.batch_id,
                    BatchStatus::Error,
                    Some("exit 1"),
                )
            })
            .unwrap();

        let stored = storage
            .with_connection(|conn| get_outgoing_batch(conn, batch.batch_id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Error);
        assert!(stored.error_flag);
        assert_eq!(stored.error_message.as_deref(), Some("exit 1"));
    }
}
