//! Incoming batch ledger
//!
//! A batch is keyed by (batch id, source node). `acquire_incoming_batch` is the
//! gate that makes applying idempotent: a batch already recorded as OK is
//! never applied again.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{BatchStatus, IncomingBatch};

fn incoming_batch_from_row(row: &Row) -> rusqlite::Result<IncomingBatch> {
    let status: String = row.get("status")?;
    let byte_count: i64 = row.get("byte_count")?;
    let statement_count: i64 = row.get("statement_count")?;
    let last_update_time: String = row.get("last_update_time")?;

    Ok(IncomingBatch {
        batch_id: row.get("batch_id")?,
        node_id: row.get("node_id")?,
        channel_id: row.get("channel_id")?,
        status: BatchStatus::from_code(&status).unwrap_or(BatchStatus::Error),
        byte_count: byte_count.max(0) as u64,
        statement_count: statement_count.max(0) as u64,
        error_flag: row.get::<_, i32>("error_flag")? != 0,
        retry: false,
        error_message: row.get("error_message")?,
        last_update_time: DateTime::parse_from_rfc3339(&last_update_time)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
    })
}

pub fn find_incoming_batch(
    conn: &Connection,
    batch_id: i64,
    node_id: &str,
) -> Result<Option<IncomingBatch>> {
    let batch = conn
        .query_row(
            "SELECT * FROM incoming_batch WHERE batch_id = ? AND node_id = ?",
            params![batch_id, node_id],
            incoming_batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

pub fn list_incoming_batches(conn: &Connection, node_id: &str) -> Result<Vec<IncomingBatch>> {
    let mut stmt =
        conn.prepare("SELECT * FROM incoming_batch WHERE node_id = ? ORDER BY batch_id")?;
    let batches = stmt
        .query_map(params![node_id], incoming_batch_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(batches)
}

/// Claim a batch for loading.
///
/// Returns `true` when the batch should be applied: either it was never seen,
/// or the previous attempt ended in error (or never finished), in which case
/// `batch.retry` is set. Returns `false` for a batch that already loaded OK.
pub fn acquire_incoming_batch(conn: &Connection, batch: &mut IncomingBatch) -> Result<bool> {
    match find_incoming_batch(conn, batch.batch_id, &batch.node_id)? {
        None => {
            batch.status = BatchStatus::Loading;
            insert_incoming_batch(conn, batch)?;
            Ok(true)
        }
        Some(existing) if existing.status == BatchStatus::Ok => {
            tracing::info!(
                "Skipping batch {} from {}, already loaded",
                batch.batch_id,
                batch.node_id
            );
            batch.status = BatchStatus::Ok;
            Ok(false)
        }
        Some(existing) => {
            tracing::info!(
                "Retrying batch {} from {} (was {})",
                batch.batch_id,
                batch.node_id,
                existing.status.code()
            );
            batch.retry = true;
            batch.status = BatchStatus::Loading;
            update_incoming_batch(conn, batch)?;
            Ok(true)
        }
    }
}

pub fn insert_incoming_batch(conn: &Connection, batch: &mut IncomingBatch) -> Result<()> {
    let now = Utc::now();
    batch.last_update_time = Some(now);
    conn.execute(
        "INSERT INTO incoming_batch (batch_id, node_id, channel_id, status, byte_count,
            statement_count, error_flag, error_message, create_time, last_update_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            batch.batch_id,
            batch.node_id,
            batch.channel_id,
            batch.status.code(),
            batch.byte_count as i64,
            batch.statement_count as i64,
            batch.error_flag,
            batch.error_message,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Update a batch; returns the number of rows touched
pub fn update_incoming_batch(conn: &Connection, batch: &mut IncomingBatch) -> Result<usize> {
    let now = Utc::now();
    batch.last_update_time = Some(now);
    let updated = conn.execute(
        "UPDATE incoming_batch SET channel_id = ?3, status = ?4, byte_count = ?5,
            statement_count = ?6, error_flag = ?7, error_message = ?8, last_update_time = ?9
         WHERE batch_id = ?1 AND node_id = ?2",
        params![
            batch.batch_id,
            batch.node_id,
            batch.channel_id,
            batch.status.code(),
            batch.byte_count as i64,
            batch.statement_count as i64,
            batch.error_flag,
            batch.error_message,
            now.to_rfc3339(),
        ],
    )?;
    Ok(updated)
}

pub fn delete_incoming_batch(conn: &Connection, batch: &IncomingBatch) -> Result<()> {
    conn.execute(
        "DELETE FROM incoming_batch WHERE batch_id = ? AND node_id = ?",
        params![batch.batch_id, batch.node_id],
    )?;
    Ok(())
}

/// Persist the outcome of applying a batch.
///
/// With `record_ok_batches` every outcome is kept. Without it an OK batch is
/// only kept out of the ledger (a retried row is deleted), while an error is
/// always recorded so the next cycle retries it.
pub fn record_incoming_batch(
    conn: &Connection,
    batch: &mut IncomingBatch,
    record_ok_batches: bool,
) -> Result<()> {
    match batch.status {
        BatchStatus::Ok if record_ok_batches => {
            update_incoming_batch(conn, batch)?;
        }
        BatchStatus::Ok => {
            // acquire inserted a LD row for a new batch too
            delete_incoming_batch(conn, batch)?;
        }
        _ => {
            if update_incoming_batch(conn, batch)? == 0 {
                insert_incoming_batch(conn, batch)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn acquire(storage: &Storage, batch: &mut IncomingBatch) -> bool {
        storage
            .with_transaction(|conn| acquire_incoming_batch(conn, batch))
            .unwrap()
    }

    #[test]
    fn test_acquire_new_batch() {
        let storage = Storage::open_in_memory().unwrap();
        let mut batch = IncomingBatch::new("corp-000", 1001, "filesync");

        assert!(acquire(&storage, &mut batch));
        assert!(!batch.retry);

        let stored = storage
            .with_connection(|conn| find_incoming_batch(conn, 1001, "corp-000"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Loading);
    }

    #[test]
    fn test_ok_batch_is_not_reacquired() {
        let storage = Storage::open_in_memory().unwrap();
        let mut batch = IncomingBatch::new("corp-000", 1001, "filesync");
        assert!(acquire(&storage, &mut batch));
        batch.status = BatchStatus::Ok;
        storage
            .with_connection(|conn| record_incoming_batch(conn, &mut batch, true))
            .unwrap();

        let mut again = IncomingBatch::new("corp-000", 1001, "filesync");
        assert!(!acquire(&storage, &mut again));

        let rows = storage
            .with_connection(|conn| list_incoming_batches(conn, "corp-000"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, BatchStatus::Ok);
    }

    #[test]
    fn test_error_batch_is_retried() {
        let storage = Storage::open_in_memory().unwrap();
        let mut batch = IncomingBatch::new("corp-000", 7, "filesync");
        assert!(acquire(&storage, &mut batch));
        batch.status = BatchStatus::Error;
        batch.error_flag = true;
        batch.error_message = Some("Error 1".into());
        storage
            .with_connection(|conn| record_incoming_batch(conn, &mut batch, true))
            .unwrap();

        let mut again = IncomingBatch::new("corp-000", 7, "filesync");
        assert!(acquire(&storage, &mut again));
        assert!(again.retry);
    }

    #[test]
    fn test_same_id_from_other_node_is_distinct() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(acquire(&storage, &mut IncomingBatch::new("a", 1, "filesync")));
        assert!(acquire(&storage, &mut IncomingBatch::new("b", 1, "filesync")));
    }

    #[test]
    fn test_ok_batches_dropped_when_not_recorded() {
        let storage = Storage::open_in_memory().unwrap();
        let mut batch = IncomingBatch::new("corp-000", 3, "filesync");
        assert!(acquire(&storage, &mut batch));
        batch.status = BatchStatus::Ok;
        storage
            .with_connection(|conn| record_incoming_batch(conn, &mut batch, false))
            .unwrap();

        assert!(storage
            .with_connection(|conn| find_incoming_batch(conn, 3, "corp-000"))
            .unwrap()
            .is_none());
    }
}
