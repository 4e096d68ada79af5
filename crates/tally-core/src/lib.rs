//! # tally-core: Pure Sync Types for Tally
//!
//! This crate holds the parts of the sync engine that do not touch the
//! outside world: the replication unit ([`SyncEvent`]), the runtime view of an
//! aggregate ([`SyncState`]), origin identity, merge strategies and
//! identifier validation.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Sync Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               tally-sync (SyncedStore, bus, resync)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   merge   │  │  origin   │  │ validation│  │   │
//! │  │   │ SyncEvent │  │ Strategy  │  │ device +  │  │ channel / │  │   │
//! │  │   │ SyncState │  │ Dispatch  │  │ tab id    │  │ entity id │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Event Log)                         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - `SyncEvent`, `SyncState`, `ScopeTags`, `EntityKey`, `Origin`
//! - [`merge`] - Merge strategies and type-tag dispatch
//! - [`error`] - Core error types
//! - [`validation`] - Identifier rules for channels, entities and event types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::merge::{BuiltinStrategy, MergeStrategy};
//!
//! let local = json!({ "a": 1, "b": 2 });
//! let merged = BuiltinStrategy::Default
//!     .merge(&local, &json!({ "a": 5 }), "state.patch")
//!     .unwrap();
//!
//! assert_eq!(merged, json!({ "a": 5, "b": 2 }));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod merge;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use merge::{BuiltinStrategy, MergeStrategy, TypeDispatch};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default event type for `set_state` calls that do not name one.
pub const EVENT_STATE_PATCH: &str = "state.patch";

/// Event type that replaces the whole snapshot.
pub const EVENT_STATE_REPLACE: &str = "state.replace";

/// Namespace prefix for every persisted slot key.
pub const SLOT_NAMESPACE: &str = "sync";

/// Maximum length of a channel name or event type tag.
pub const MAX_TAG_LEN: usize = 64;

/// Maximum length of an entity id.
pub const MAX_ENTITY_ID_LEN: usize = 128;
