//! Property-based tests for filesync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Diffing a snapshot against itself finds nothing
//! - Diff events are exactly the created, modified and deleted paths
//! - Replaying the diff onto the old snapshot yields the new one
//! - Acknowledgment payloads parse back to what was built
//!
//! Run with: cargo test --test property_tests

use std::collections::BTreeMap;

use proptest::prelude::*;

// ============================================================================
// SNAPSHOT DIFF TESTS
// ============================================================================

mod diff_tests {
    use super::*;
    use filesync::snapshot::{diff, DirectorySnapshot, FileSnapshot};
    use filesync::types::*;

    type Listing = BTreeMap<(String, String), (u64, i64)>;

    fn rule() -> FileTriggerRouter {
        FileTriggerRouter::new(
            FileTrigger::new("docs", "/srv/docs"),
            FileRouter {
                router_id: "corp_to_store".to_string(),
                source_node_group_id: "corp".to_string(),
                target_node_group_id: "store".to_string(),
            },
        )
    }

    fn snapshot(listing: &Listing) -> DirectorySnapshot {
        let rule = rule();
        let mut snapshot = DirectorySnapshot::for_rule(&rule);
        for ((dir, name), (size, mtime)) in listing {
            let mut file = FileSnapshot::new(&rule, dir.clone(), name.clone());
            file.file_size = *size;
            file.file_modified_time = *mtime;
            snapshot.insert(file).unwrap();
        }
        snapshot
    }

    fn listing() -> impl Strategy<Value = Listing> {
        prop::collection::btree_map(
            (prop_oneof![Just(".".to_string()), "[a-c]{1,2}"], "[a-e]{1,3}\\.txt"),
            (0u64..4, 0i64..4),
            0..24,
        )
    }

    proptest! {
        /// Invariant: a snapshot never differs from itself
        #[test]
        fn self_diff_is_empty(files in listing()) {
            let s = snapshot(&files);
            prop_assert!(diff(&s, &s, false).unwrap().is_empty());
            prop_assert!(diff(&s, &s, true).unwrap().is_empty());
        }

        /// Invariant: events are exactly creates, modifies and deletes
        #[test]
        fn events_match_set_differences(before in listing(), after in listing()) {
            let changes = diff(&snapshot(&before), &snapshot(&after), false).unwrap();

            for ((dir, name), attrs) in &after {
                let path = filesync::snapshot::relative_path(dir, name);
                let event = changes.get(&path).and_then(|f| f.last_event_type);
                match before.get(&(dir.clone(), name.clone())) {
                    None => prop_assert_eq!(event, Some(LastEventType::Create)),
                    Some(old) if old != attrs => {
                        prop_assert_eq!(event, Some(LastEventType::Modify))
                    }
                    Some(_) => prop_assert_eq!(event, None),
                }
            }
            for (dir, name) in before.keys() {
                if !after.contains_key(&(dir.clone(), name.clone())) {
                    let path = filesync::snapshot::relative_path(dir, name);
                    prop_assert_eq!(
                        changes.get(&path).and_then(|f| f.last_event_type),
                        Some(LastEventType::Delete)
                    );
                }
            }
        }

        /// Invariant: applying the events to the old state reproduces the new one
        #[test]
        fn replay_reaches_new_state(before in listing(), after in listing()) {
            let changes = diff(&snapshot(&before), &snapshot(&after), false).unwrap();

            let mut replayed = before.clone();
            for file in &changes {
                let key = (file.relative_dir.clone(), file.file_name.clone());
                match file.last_event_type {
                    Some(LastEventType::Delete) => {
                        replayed.remove(&key);
                    }
                    _ => {
                        replayed.insert(key, (file.file_size, file.file_modified_time));
                    }
                }
            }
            prop_assert_eq!(replayed, after);
        }
    }
}

// ============================================================================
// ACKNOWLEDGMENT TESTS
// ============================================================================

mod ack_tests {
    use super::*;
    use filesync::transport::{build_ack, parse_ack, BatchAck};

    proptest! {
        /// Invariant: any error text survives the form encoding
        #[test]
        fn ack_round_trip(
            acks in prop::collection::vec((1i64..1_000_000, prop::option::of("\\PC{1,40}")), 0..8)
        ) {
            let acks: Vec<BatchAck> = acks
                .into_iter()
                .map(|(batch_id, error)| BatchAck {
                    batch_id,
                    error: error.filter(|e| !e.eq_ignore_ascii_case("ok")),
                })
                .collect();
            prop_assert_eq!(parse_ack(&build_ack(&acks)), acks);
        }

        /// Invariant: parsing never panics on arbitrary input
        #[test]
        fn parse_never_panics(s in ".*") {
            let _ = parse_ack(&s);
        }
    }
}
