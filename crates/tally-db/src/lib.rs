//! # tally-db: Event Log Storage for Tally Sync
//!
//! This crate provides the durable, append-only sync event log. It uses
//! SQLite for storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Sync Data Flow                             │
//! │                                                                         │
//! │  SyncedStore flush / Resync query                                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │    │   (events.rs)      │  │ (embedded) │  │   │
//! │  │   │               │    │                    │  │            │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncEventRepository│  │ 001_sync_  │  │   │
//! │  │   │ Connection    │    │ insert / since /   │  │ events.sql │  │   │
//! │  │   │ Management    │    │ latest / prune     │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (sync_events)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/sync.db")).await?;
//!
//! db.sync_events().insert(&event).await?;
//! let missed = db.sync_events().list_since("inventory", "store-001", 12).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig, DbLocation};
pub use repository::events::SyncEventRepository;
