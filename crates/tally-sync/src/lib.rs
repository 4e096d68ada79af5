//! # tally-sync: Sync Engine for Tally
//!
//! Keeps logical aggregates (stock levels, cash sessions, loyalty balances)
//! consistent across tabs of one device and across devices, without a lock
//! server.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncedStore<T> (one per entity)                 │  │
//! │  │                                                                  │  │
//! │  │  Optimistic local writes, persisted slot, version gate,         │  │
//! │  │  debounced outbound, reentrancy guard                           │  │
//! │  └───────┬──────────────────────┬──────────────────────┬───────────┘  │
//! │          │                      │                      │              │
//! │          ▼                      ▼                      ▼              │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐   │
//! │  │ BroadcastBus   │  │ EventLog           │  │ Resync             │   │
//! │  │                │  │                    │  │                    │   │
//! │  │ Same device,   │  │ Durable, ordered   │  │ Catch-up after     │   │
//! │  │ every tab      │  │ per entity;        │  │ reload, reconnect  │   │
//! │  │ (fast path)    │  │ push feed per      │  │ or lagged feed     │   │
//! │  │                │  │ channel            │  │                    │   │
//! │  └────────────────┘  └─────────┬──────────┘  └────────────────────┘   │
//! │                                │                                       │
//! │                                ▼                                       │
//! │                      ┌────────────────────┐                            │
//! │                      │ PushListener       │                            │
//! │                      │ other devices      │                            │
//! │                      └────────────────────┘                            │
//! │                                                                         │
//! │  ORDERING: every path goes through apply_inbound. Events at or below  │
//! │  the watermark and events from the store's own origin are dropped.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`store`] - `SyncedStore`, the per-entity container
//! - [`broadcast`] - Same-device bus and envelope
//! - [`log`] - `EventLog` trait with SQLite and in-memory adapters
//! - [`push`] - Cross-device push listener
//! - [`resync`] - Catch-up pass, single-flight registry, reconnect trigger
//!
//! ### Host Integration
//! - [`config`] - Sync configuration (TOML + environment)
//! - [`context`] - Shared dependencies and connectivity
//! - [`slot`] - Persisted snapshot storage
//! - [`origin`] - Origin derivation from slots
//! - [`emitter`] - Error reporting callback
//! - [`error`] - Sync error types
//!
//! ### Domain
//! - [`domain`] - Inventory, cash session and loyalty stores
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{InventoryStore, SyncConfig, SyncContext};
//!
//! let config = SyncConfig::load_or_default(None);
//! let ctx = SyncContext::from_config(&config).await?;
//!
//! let inventory = InventoryStore::new(&ctx, "store-001")?;
//! let store = inventory.start()?;
//! let _sub = store.subscribe(|state| println!("v{} {:?}", state.version, state.data));
//!
//! inventory.set_stock("COKE-330", 24)?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Engine
pub mod broadcast;
pub mod log;
pub mod push;
pub mod resync;
pub mod store;

// Host integration
pub mod config;
pub mod context;
pub mod emitter;
pub mod error;
pub mod origin;
pub mod slot;

// Domain stores
pub mod domain;

// =============================================================================
// Re-exports
// =============================================================================

// Engine types
pub use broadcast::{BroadcastBus, BroadcastEnvelope, BROADCAST_CHANNEL_NAME};
pub use log::{EventLog, MemoryEventLog, SqliteEventLog};
pub use push::PushListener;
pub use resync::{resync, ResyncOutcome, ResyncRegistry, ResyncReport, ResyncTrigger};
pub use store::{ApplyOutcome, StoreConfig, StoreData, Subscription, SyncedStore, WeakStore};

// Host integration types
pub use config::SyncConfig;
pub use context::{Connectivity, SyncContext};
pub use emitter::{NoOpEmitter, SyncEventEmitter, TracingEmitter};
pub use error::{SyncError, SyncResult};
pub use origin::OriginFromSlots;
pub use slot::{FileSlotStore, MemorySlotStore, SlotStore};

// Domain types
pub use domain::{
    CashSession, CashSessionStore, DomainStore, InventoryStore, LoyaltyBalance, LoyaltyStore, SessionStatus,
    StockLevels,
};
