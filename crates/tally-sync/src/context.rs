//! # Sync Context
//!
//! Everything a store needs from its host, bundled once per process and
//! cloned into every store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncContext                                    │
//! │                                                                         │
//! │   origin         device:tab token stamped on outbound events           │
//! │   bus            same-device fan-out (BroadcastBus)                    │
//! │   log            durable event log + push feed (EventLog)              │
//! │   slots          persisted snapshots (SlotStore)                       │
//! │   registry       one resync per entity at a time                       │
//! │   connectivity   host-reported online flag (watch channel)             │
//! │   emitter        errors with no awaiting caller                        │
//! │   scope/debounce defaults for stores built by `store_config`           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use tally_core::validation::{validate_channel, validate_entity_id};
use tally_core::{Origin, ScopeTags};
use tally_db::Database;

use crate::broadcast::BroadcastBus;
use crate::config::SyncConfig;
use crate::emitter::{SyncEventEmitter, TracingEmitter};
use crate::error::{SyncError, SyncResult};
use crate::log::{EventLog, SqliteEventLog};
use crate::resync::ResyncRegistry;
use crate::slot::{FileSlotStore, SlotStore};
use crate::store::StoreConfig;

// =============================================================================
// Connectivity
// =============================================================================

/// Host-reported online flag.
///
/// Receivers only wake on real changes; setting the current value again is
/// silent.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Connectivity { tx: Arc::new(tx) }
    }

    /// Reports a connectivity change. Returns true if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Connectivity::new(true)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared dependencies of every store in a process.
#[derive(Clone)]
pub struct SyncContext {
    pub origin: Origin,
    pub bus: BroadcastBus,
    pub log: Arc<dyn EventLog>,
    pub slots: Arc<dyn SlotStore>,
    pub registry: ResyncRegistry,
    pub connectivity: Connectivity,
    pub emitter: Arc<dyn SyncEventEmitter>,
    pub scope: ScopeTags,
    pub debounce: Option<Duration>,
}

impl SyncContext {
    /// Context with a private bus, online connectivity, no debounce and the
    /// tracing emitter.
    pub fn new(origin: Origin, log: Arc<dyn EventLog>, slots: Arc<dyn SlotStore>) -> Self {
        SyncContext {
            origin,
            bus: BroadcastBus::default(),
            log,
            slots,
            registry: ResyncRegistry::default(),
            connectivity: Connectivity::default(),
            emitter: Arc::new(TracingEmitter),
            scope: ScopeTags::default(),
            debounce: None,
        }
    }

    /// Builds the production context: file slots and the SQLite event log at
    /// the configured paths.
    pub async fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let slot_dir = config
            .slot_dir()
            .ok_or_else(|| SyncError::InvalidConfig("no slot directory available".into()))?;
        let db_config = config
            .db_config()
            .ok_or_else(|| SyncError::InvalidConfig("no database path available".into()))?;
        let db_path = config.database_path().unwrap_or_default();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let slots = FileSlotStore::open(&slot_dir)?;
        let db = Database::new(db_config).await?;
        let log = SqliteEventLog::with_push_capacity(db, config.sync.push_capacity);

        let origin = Origin::new(config.device_id(), Uuid::new_v4().to_string());
        info!(
            origin = %origin,
            slots = %slot_dir.display(),
            database = %db_path.display(),
            "Sync context ready"
        );

        Ok(SyncContext {
            bus: BroadcastBus::new(config.sync.broadcast_capacity),
            scope: config.store.scope(),
            debounce: config.debounce(),
            ..SyncContext::new(origin, Arc::new(log), Arc::new(slots))
        })
    }

    /// Same context under another origin (a second tab of this process).
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_bus(mut self, bus: BroadcastBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_slots(mut self, slots: Arc<dyn SlotStore>) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_scope(mut self, scope: ScopeTags) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_debounce(mut self, window: Option<Duration>) -> Self {
        self.debounce = window;
        self
    }

    /// Store configuration for one entity using this context's defaults.
    pub fn store_config(&self, channel: &str, entity_id: &str) -> SyncResult<StoreConfig> {
        validate_channel(channel)?;
        validate_entity_id(entity_id)?;

        let config = StoreConfig::new(channel, entity_id).with_scope(self.scope.clone());
        Ok(match self.debounce {
            Some(window) => config.with_debounce(window),
            None => config,
        })
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("origin", &self.origin)
            .field("scope", &self.scope)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}
