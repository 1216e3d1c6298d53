//! Routing captured changes into outgoing batches

use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::error::Result;
use crate::snapshot::DirectorySnapshot;
use crate::storage::{nodes, outgoing, OutgoingEvent};
use crate::types::{FileTriggerRouter, LastEventType, OutgoingBatch};

/// Turn the changes of one rule into one batch per (target node, channel).
///
/// A change is skipped for a node when the rule is disabled, the trigger does
/// not sync that kind of event, or the change arrived from that very node.
pub fn route_changes(
    conn: &Connection,
    local_node_id: &str,
    rule: &FileTriggerRouter,
    changes: &DirectorySnapshot,
) -> Result<Vec<OutgoingBatch>> {
    if !rule.enabled || changes.is_empty() {
        return Ok(Vec::new());
    }

    let targets: Vec<_> = nodes::get_nodes_in_group(conn, &rule.router.target_node_group_id)?
        .into_iter()
        .filter(|node| node.node_id != local_node_id)
        .collect();
    if targets.is_empty() {
        tracing::debug!(
            "No nodes in group {} for router {}",
            rule.router.target_node_group_id,
            rule.router_id()
        );
        return Ok(Vec::new());
    }

    let mut pending: BTreeMap<(String, String), Vec<OutgoingEvent>> = BTreeMap::new();
    for file in changes {
        let event = file.last_event_type.unwrap_or(LastEventType::Modify);
        if !rule.trigger.is_event_enabled(event) {
            continue;
        }
        for node in &targets {
            if file.last_update_by.as_deref() == Some(node.node_id.as_str()) {
                continue;
            }
            pending
                .entry((node.node_id.clone(), file.channel_id.clone()))
                .or_default()
                .push(OutgoingEvent::File(file.clone()));
        }
    }

    let mut batches = Vec::with_capacity(pending.len());
    for ((node_id, channel_id), events) in pending {
        let batch = outgoing::insert_outgoing_batch(conn, &node_id, &channel_id, &events)?;
        tracing::debug!(
            "Routed {} events to {} in batch {}",
            events.len(),
            node_id,
            batch.batch_id
        );
        batches.push(batch);
    }
    Ok(batches)
}
