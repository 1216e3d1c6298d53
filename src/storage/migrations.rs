//! Database migrations for file sync

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Watch rules and the snapshot ledger (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS file_trigger (
            trigger_id TEXT PRIMARY KEY,
            base_dir TEXT NOT NULL,
            recurse INTEGER NOT NULL DEFAULT 1,
            includes_files TEXT,
            excludes_files TEXT,
            sync_on_create INTEGER NOT NULL DEFAULT 1,
            sync_on_modified INTEGER NOT NULL DEFAULT 1,
            sync_on_delete INTEGER NOT NULL DEFAULT 1,
            sync_on_ctl_file INTEGER NOT NULL DEFAULT 0,
            before_copy_script TEXT,
            after_copy_script TEXT,
            channel_id TEXT NOT NULL DEFAULT 'filesync',
            reload_channel_id TEXT NOT NULL DEFAULT 'filesync_reload',
            create_time TEXT NOT NULL,
            last_update_by TEXT,
            last_update_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_router (
            router_id TEXT PRIMARY KEY,
            source_node_group_id TEXT NOT NULL,
            target_node_group_id TEXT NOT NULL,
            create_time TEXT NOT NULL,
            last_update_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_trigger_router (
            trigger_id TEXT NOT NULL REFERENCES file_trigger(trigger_id) ON DELETE CASCADE,
            router_id TEXT NOT NULL REFERENCES file_router(router_id) ON DELETE CASCADE,
            enabled INTEGER NOT NULL DEFAULT 1,
            initial_load_enabled INTEGER NOT NULL DEFAULT 1,
            target_base_dir TEXT,
            conflict_strategy TEXT NOT NULL DEFAULT 'source_wins',
            create_time TEXT NOT NULL,
            last_update_by TEXT,
            last_update_time TEXT NOT NULL,
            PRIMARY KEY (trigger_id, router_id)
        );

        -- One live row per file and rule; Delete rows are removed once captured
        CREATE TABLE IF NOT EXISTS file_snapshot (
            trigger_id TEXT NOT NULL,
            router_id TEXT NOT NULL,
            relative_dir TEXT NOT NULL,
            file_name TEXT NOT NULL,
            last_event_type TEXT NOT NULL,
            crc32_checksum INTEGER NOT NULL DEFAULT 0,
            old_crc32_checksum INTEGER,
            file_size INTEGER NOT NULL DEFAULT 0,
            file_modified_time INTEGER NOT NULL DEFAULT 0,
            channel_id TEXT NOT NULL,
            reload_channel_id TEXT NOT NULL,
            create_time TEXT NOT NULL,
            last_update_by TEXT,
            last_update_time TEXT NOT NULL,
            PRIMARY KEY (trigger_id, router_id, relative_dir, file_name)
        );

        -- Files written by incoming batches, keyed by absolute target location
        CREATE TABLE IF NOT EXISTS file_incoming (
            relative_dir TEXT NOT NULL,
            file_name TEXT NOT NULL,
            last_event_type TEXT NOT NULL,
            node_id TEXT NOT NULL,
            file_modified_time INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (relative_dir, file_name)
        );

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Nodes, channels and batch ledgers (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channel (
            channel_id TEXT PRIMARY KEY,
            processing_order INTEGER NOT NULL DEFAULT 1,
            enabled INTEGER NOT NULL DEFAULT 1,
            description TEXT
        );

        INSERT OR IGNORE INTO channel (channel_id, processing_order, description)
            VALUES ('filesync', 1, 'Captured file changes');
        INSERT OR IGNORE INTO channel (channel_id, processing_order, description)
            VALUES ('filesync_reload', 2, 'Full resync of watched directories');

        CREATE TABLE IF NOT EXISTS node (
            node_id TEXT PRIMARY KEY,
            node_group_id TEXT NOT NULL,
            sync_url TEXT,
            sync_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_node_group ON node(node_group_id);

        -- P: source pushes to target, W: target pulls from source
        CREATE TABLE IF NOT EXISTS node_group_link (
            source_node_group_id TEXT NOT NULL,
            target_node_group_id TEXT NOT NULL,
            data_event_action TEXT NOT NULL DEFAULT 'W',
            PRIMARY KEY (source_node_group_id, target_node_group_id)
        );

        CREATE TABLE IF NOT EXISTS outgoing_batch (
            batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'NE',
            byte_count INTEGER NOT NULL DEFAULT 0,
            data_event_count INTEGER NOT NULL DEFAULT 0,
            error_flag INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            create_time TEXT NOT NULL,
            last_update_time TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outgoing_batch_pending
            ON outgoing_batch(node_id, channel_id, status);

        -- event_type is C, M, D or R (reload)
        CREATE TABLE IF NOT EXISTS outgoing_batch_event (
            batch_id INTEGER NOT NULL REFERENCES outgoing_batch(batch_id) ON DELETE CASCADE,
            event_seq INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            trigger_id TEXT,
            router_id TEXT,
            relative_dir TEXT,
            file_name TEXT,
            crc32_checksum INTEGER NOT NULL DEFAULT 0,
            old_crc32_checksum INTEGER,
            file_size INTEGER NOT NULL DEFAULT 0,
            file_modified_time INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (batch_id, event_seq)
        );

        CREATE TABLE IF NOT EXISTS incoming_batch (
            batch_id INTEGER NOT NULL,
            node_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            status TEXT NOT NULL,
            byte_count INTEGER NOT NULL DEFAULT 0,
            statement_count INTEGER NOT NULL DEFAULT 0,
            error_flag INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            create_time TEXT NOT NULL,
            last_update_time TEXT NOT NULL,
            PRIMARY KEY (batch_id, node_id)
        );

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}
