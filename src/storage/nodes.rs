//! Nodes and the group links that decide who pushes and who pulls

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{CommunicationType, DataEventAction, Node};

fn node_from_row(row: &Row) -> rusqlite::Result<Node> {
    Ok(Node {
        node_id: row.get("node_id")?,
        node_group_id: row.get("node_group_id")?,
        sync_url: row.get("sync_url")?,
        sync_enabled: row.get::<_, i32>("sync_enabled")? != 0,
    })
}

/// Insert or update a node
pub fn save_node(conn: &Connection, node: &Node) -> Result<()> {
    conn.execute(
        "INSERT INTO node (node_id, node_group_id, sync_url, sync_enabled)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(node_id) DO UPDATE SET
            node_group_id = excluded.node_group_id,
            sync_url = excluded.sync_url,
            sync_enabled = excluded.sync_enabled",
        params![
            node.node_id,
            node.node_group_id,
            node.sync_url,
            node.sync_enabled
        ],
    )?;
    Ok(())
}

pub fn get_node(conn: &Connection, node_id: &str) -> Result<Option<Node>> {
    let node = conn
        .query_row(
            "SELECT * FROM node WHERE node_id = ?",
            params![node_id],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

/// Sync-enabled nodes of a group
pub fn get_nodes_in_group(conn: &Connection, node_group_id: &str) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM node WHERE node_group_id = ? AND sync_enabled = 1 ORDER BY node_id",
    )?;
    let nodes = stmt
        .query_map(params![node_group_id], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

pub fn save_node_group_link(
    conn: &Connection,
    source_node_group_id: &str,
    target_node_group_id: &str,
    action: DataEventAction,
) -> Result<()> {
    conn.execute(
        "INSERT INTO node_group_link (source_node_group_id, target_node_group_id, data_event_action)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(source_node_group_id, target_node_group_id) DO UPDATE SET
            data_event_action = excluded.data_event_action",
        params![source_node_group_id, target_node_group_id, action.code()],
    )?;
    Ok(())
}

/// Remote nodes this node talks to for one kind of communication.
///
/// Push targets are nodes of groups this node's group pushes to. Pull sources
/// are nodes of groups that wait for this node's group to pull from them.
pub fn get_nodes_to_communicate_with(
    conn: &Connection,
    local_node_id: &str,
    local_node_group_id: &str,
    communication_type: CommunicationType,
) -> Result<Vec<Node>> {
    let sql = if communication_type.is_push() {
        "SELECT n.* FROM node n
         INNER JOIN node_group_link l ON l.target_node_group_id = n.node_group_id
         WHERE l.source_node_group_id = ?1 AND l.data_event_action = 'P'
           AND n.sync_enabled = 1 AND n.node_id != ?2
         ORDER BY n.node_id"
    } else {
        "SELECT n.* FROM node n
         INNER JOIN node_group_link l ON l.source_node_group_id = n.node_group_id
         WHERE l.target_node_group_id = ?1 AND l.data_event_action = 'W'
           AND n.sync_enabled = 1 AND n.node_id != ?2
         ORDER BY n.node_id"
    };

    let mut stmt = conn.prepare(sql)?;
    let nodes = stmt
        .query_map(params![local_node_group_id, local_node_id], node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn setup() -> Storage {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                save_node(conn, &Node::new("corp-000", "corp"))?;
                save_node(conn, &Node::new("store-001", "store"))?;
                let mut disabled = Node::new("store-002", "store");
                disabled.sync_enabled = false;
                save_node(conn, &disabled)?;
                save_node_group_link(conn, "corp", "store", DataEventAction::Push)?;
                save_node_group_link(conn, "store", "corp", DataEventAction::WaitForPull)
            })
            .unwrap();
        storage
    }

    #[test]
    fn test_push_targets() {
        let storage = setup();
        let nodes = storage
            .with_connection(|conn| {
                get_nodes_to_communicate_with(
                    conn,
                    "corp-000",
                    "corp",
                    CommunicationType::FilePush,
                )
            })
            .unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["store-001"]);
    }

    #[test]
    fn test_pull_sources() {
        let storage = setup();
        let nodes = storage
            .with_connection(|conn| {
                get_nodes_to_communicate_with(
                    conn,
                    "corp-000",
                    "corp",
                    CommunicationType::FilePull,
                )
            })
            .unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["store-001"]);

        let none = storage
            .with_connection(|conn| {
                get_nodes_to_communicate_with(
                    conn,
                    "store-001",
                    "store",
                    CommunicationType::OfflineFilePull,
                )
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_save_node_updates() {
        let storage = setup();
        let mut node = Node::new("store-001", "store");
        node.sync_url = Some("http://store-001:31415/sync".into());
        storage.with_connection(|conn| save_node(conn, &node)).unwrap();

        let loaded = storage
            .with_connection(|conn| get_node(conn, "store-001"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, node);
        assert_eq!(
            storage
                .with_connection(|conn| get_nodes_in_group(conn, "store"))
                .unwrap()
                .len(),
            1
        );
    }
}
