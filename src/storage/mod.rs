//! Storage engine for file sync
//!
//! Handles SQLite database operations, WAL mode, and schema management for
//! the configuration store and both ledgers.

mod connection;
mod migrations;
pub mod incoming;
pub mod nodes;
pub mod outgoing;
pub mod snapshots;
pub mod triggers;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;
pub use outgoing::OutgoingEvent;
