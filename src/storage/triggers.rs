//! Configuration store for watch rules: triggers, routers and their pairings

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{FileRouter, FileTrigger, FileTriggerRouter};

const SELECT_TRIGGER_ROUTERS: &str = r#"
    SELECT t.trigger_id, t.base_dir, t.recurse, t.includes_files, t.excludes_files,
           t.sync_on_create, t.sync_on_modified, t.sync_on_delete, t.sync_on_ctl_file,
           t.before_copy_script, t.after_copy_script, t.channel_id, t.reload_channel_id,
           t.last_update_by AS trigger_last_update_by,
           r.router_id, r.source_node_group_id, r.target_node_group_id,
           tr.enabled, tr.initial_load_enabled, tr.target_base_dir, tr.conflict_strategy,
           tr.last_update_by AS tr_last_update_by
    FROM file_trigger_router tr
    INNER JOIN file_trigger t ON t.trigger_id = tr.trigger_id
    INNER JOIN file_router r ON r.router_id = tr.router_id
"#;

fn trigger_from_row(row: &Row, last_update_by_col: &str) -> rusqlite::Result<FileTrigger> {
    Ok(FileTrigger {
        trigger_id: row.get("trigger_id")?,
        base_dir: row.get("base_dir")?,
        recurse: row.get::<_, i32>("recurse")? != 0,
        includes_files: row.get("includes_files")?,
        excludes_files: row.get("excludes_files")?,
        sync_on_create: row.get::<_, i32>("sync_on_create")? != 0,
        sync_on_modified: row.get::<_, i32>("sync_on_modified")? != 0,
        sync_on_delete: row.get::<_, i32>("sync_on_delete")? != 0,
        sync_on_ctl_file: row.get::<_, i32>("sync_on_ctl_file")? != 0,
        before_copy_script: row.get("before_copy_script")?,
        after_copy_script: row.get("after_copy_script")?,
        channel_id: row.get("channel_id")?,
        reload_channel_id: row.get("reload_channel_id")?,
        last_update_by: row.get(last_update_by_col)?,
    })
}

fn router_from_row(row: &Row) -> rusqlite::Result<FileRouter> {
    Ok(FileRouter {
        router_id: row.get("router_id")?,
        source_node_group_id: row.get("source_node_group_id")?,
        target_node_group_id: row.get("target_node_group_id")?,
    })
}

fn trigger_router_from_row(row: &Row) -> rusqlite::Result<FileTriggerRouter> {
    let strategy: String = row.get("conflict_strategy")?;
    Ok(FileTriggerRouter {
        trigger: trigger_from_row(row, "trigger_last_update_by")?,
        router: router_from_row(row)?,
        enabled: row.get::<_, i32>("enabled")? != 0,
        initial_load_enabled: row.get::<_, i32>("initial_load_enabled")? != 0,
        target_base_dir: row.get("target_base_dir")?,
        conflict_strategy: strategy.parse().unwrap_or_default(),
        last_update_by: row.get("tr_last_update_by")?,
    })
}

/// Insert or update a trigger
pub fn save_file_trigger(conn: &Connection, trigger: &FileTrigger) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE file_trigger SET base_dir = ?2, recurse = ?3, includes_files = ?4,
            excludes_files = ?5, sync_on_create = ?6, sync_on_modified = ?7,
            sync_on_delete = ?8, sync_on_ctl_file = ?9, before_copy_script = ?10,
            after_copy_script = ?11, channel_id = ?12, reload_channel_id = ?13,
            last_update_by = ?14, last_update_time = ?15
         WHERE trigger_id = ?1",
        params![
            trigger.trigger_id,
            trigger.base_dir,
            trigger.recurse,
            trigger.includes_files,
            trigger.excludes_files,
            trigger.sync_on_create,
            trigger.sync_on_modified,
            trigger.sync_on_delete,
            trigger.sync_on_ctl_file,
            trigger.before_copy_script,
            trigger.after_copy_script,
            trigger.channel_id,
            trigger.reload_channel_id,
            trigger.last_update_by,
            now,
        ],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO file_trigger (trigger_id, base_dir, recurse, includes_files,
                excludes_files, sync_on_create, sync_on_modified, sync_on_delete,
                sync_on_ctl_file, before_copy_script, after_copy_script, channel_id,
                reload_channel_id, last_update_by, create_time, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                trigger.trigger_id,
                trigger.base_dir,
                trigger.recurse,
                trigger.includes_files,
                trigger.excludes_files,
                trigger.sync_on_create,
                trigger.sync_on_modified,
                trigger.sync_on_delete,
                trigger.sync_on_ctl_file,
                trigger.before_copy_script,
                trigger.after_copy_script,
                trigger.channel_id,
                trigger.reload_channel_id,
                trigger.last_update_by,
                now,
            ],
        )?;
    }

    Ok(())
}

/// Insert or update a router
pub fn save_file_router(conn: &Connection, router: &FileRouter) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE file_router SET source_node_group_id = ?2, target_node_group_id = ?3,
            last_update_time = ?4
         WHERE router_id = ?1",
        params![
            router.router_id,
            router.source_node_group_id,
            router.target_node_group_id,
            now
        ],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO file_router (router_id, source_node_group_id, target_node_group_id,
                create_time, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                router.router_id,
                router.source_node_group_id,
                router.target_node_group_id,
                now
            ],
        )?;
    }

    Ok(())
}

/// Insert or update the pairing row; the trigger and router must already exist
pub fn save_file_trigger_router(conn: &Connection, rule: &FileTriggerRouter) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE file_trigger_router SET enabled = ?3, initial_load_enabled = ?4,
            target_base_dir = ?5, conflict_strategy = ?6, last_update_by = ?7,
            last_update_time = ?8
         WHERE trigger_id = ?1 AND router_id = ?2",
        params![
            rule.trigger_id(),
            rule.router_id(),
            rule.enabled,
            rule.initial_load_enabled,
            rule.target_base_dir,
            rule.conflict_strategy.as_str(),
            rule.last_update_by,
            now,
        ],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO file_trigger_router (trigger_id, router_id, enabled,
                initial_load_enabled, target_base_dir, conflict_strategy, last_update_by,
                create_time, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                rule.trigger_id(),
                rule.router_id(),
                rule.enabled,
                rule.initial_load_enabled,
                rule.target_base_dir,
                rule.conflict_strategy.as_str(),
                rule.last_update_by,
                now,
            ],
        )?;
    }

    Ok(())
}

/// Save a complete rule: trigger, router and pairing
pub fn save_rule(conn: &Connection, rule: &FileTriggerRouter) -> Result<()> {
    save_file_trigger(conn, &rule.trigger)?;
    save_file_router(conn, &rule.router)?;
    save_file_trigger_router(conn, rule)
}

pub fn get_file_trigger(conn: &Connection, trigger_id: &str) -> Result<Option<FileTrigger>> {
    let trigger = conn
        .query_row(
            "SELECT * FROM file_trigger WHERE trigger_id = ?",
            params![trigger_id],
            |row| trigger_from_row(row, "last_update_by"),
        )
        .optional()?;
    Ok(trigger)
}

pub fn get_file_triggers(conn: &Connection) -> Result<Vec<FileTrigger>> {
    let mut stmt = conn.prepare("SELECT * FROM file_trigger ORDER BY trigger_id")?;
    let triggers = stmt
        .query_map([], |row| trigger_from_row(row, "last_update_by"))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(triggers)
}

pub fn get_file_router(conn: &Connection, router_id: &str) -> Result<Option<FileRouter>> {
    let router = conn
        .query_row(
            "SELECT * FROM file_router WHERE router_id = ?",
            params![router_id],
            router_from_row,
        )
        .optional()?;
    Ok(router)
}

pub fn get_file_trigger_router(
    conn: &Connection,
    trigger_id: &str,
    router_id: &str,
) -> Result<Option<FileTriggerRouter>> {
    let sql = format!(
        "{} WHERE tr.trigger_id = ? AND tr.router_id = ?",
        SELECT_TRIGGER_ROUTERS
    );
    let rule = conn
        .query_row(&sql, params![trigger_id, router_id], trigger_router_from_row)
        .optional()?;
    Ok(rule)
}

pub fn get_file_trigger_routers(conn: &Connection) -> Result<Vec<FileTriggerRouter>> {
    let sql = format!("{} ORDER BY tr.trigger_id, tr.router_id", SELECT_TRIGGER_ROUTERS);
    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map([], trigger_router_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rules)
}

/// Rules whose router sends from `node_group_id`, enabled or not
pub fn get_file_trigger_routers_for_source_group(
    conn: &Connection,
    node_group_id: &str,
) -> Result<Vec<FileTriggerRouter>> {
    let sql = format!(
        "{} WHERE r.source_node_group_id = ? ORDER BY tr.trigger_id, tr.router_id",
        SELECT_TRIGGER_ROUTERS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map(params![node_group_id], trigger_router_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::ConflictStrategy;
    use pretty_assertions::assert_eq;

    fn rule(trigger_id: &str, source: &str, target: &str) -> FileTriggerRouter {
        FileTriggerRouter::new(
            FileTrigger::new(trigger_id, format!("/data/{}", trigger_id)),
            FileRouter {
                router_id: format!("{}_2_{}", source, target),
                source_node_group_id: source.into(),
                target_node_group_id: target.into(),
            },
        )
    }

    #[test]
    fn test_save_and_get_rule() {
        let storage = Storage::open_in_memory().unwrap();
        let mut rule = rule("docs", "corp", "store");
        rule.trigger.includes_files = Some("*.txt,*.csv".into());
        rule.target_base_dir = Some("${appRoot}/docs".into());
        rule.conflict_strategy = ConflictStrategy::TargetWins;

        storage.with_transaction(|conn| save_rule(conn, &rule)).unwrap();

        let loaded = storage
            .with_connection(|conn| get_file_trigger_router(conn, "docs", "corp_2_store"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, rule);
    }

    #[test]
    fn test_save_is_update_then_insert() {
        let storage = Storage::open_in_memory().unwrap();
        let mut trigger = FileTrigger::new("docs", "/data/docs");
        storage
            .with_connection(|conn| save_file_trigger(conn, &trigger))
            .unwrap();

        trigger.base_dir = "/data/other".into();
        trigger.recurse = false;
        storage
            .with_connection(|conn| save_file_trigger(conn, &trigger))
            .unwrap();

        let triggers = storage.with_connection(get_file_triggers).unwrap();
        assert_eq!(triggers, vec![trigger]);
    }

    #[test]
    fn test_routers_for_source_group() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                save_rule(conn, &rule("docs", "corp", "store"))?;
                save_rule(conn, &rule("uploads", "store", "corp"))
            })
            .unwrap();

        let corp = storage
            .with_connection(|conn| get_file_trigger_routers_for_source_group(conn, "corp"))
            .unwrap();
        assert_eq!(corp.len(), 1);
        assert_eq!(corp[0].trigger_id(), "docs");

        let all = storage.with_connection(get_file_trigger_routers).unwrap();
        assert_eq!(all.len(), 2);
        assert!(storage
            .with_connection(|conn| get_file_trigger(conn, "missing"))
            .unwrap()
            .is_none());
    }
}
