//! # Repository Module
//!
//! Database repository implementations for the sync event log.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SqliteEventLog (tally-sync)                                           │
//! │       │                                                                 │
//! │       │  db.sync_events().list_since("inventory", "store-001", 12)     │
//! │       ▼                                                                 │
//! │  SyncEventRepository                                                   │
//! │  ├── insert(&self, event)                                              │
//! │  ├── list_since(&self, channel, entity_id, since)                      │
//! │  ├── latest_version(&self, channel, entity_id)                         │
//! │  ├── count_for_entity(&self, channel, entity_id)                       │
//! │  └── prune_before(&self, channel, entity_id, version)                  │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database (sync_events)                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`events::SyncEventRepository`] - Append-only event log

pub mod events;
