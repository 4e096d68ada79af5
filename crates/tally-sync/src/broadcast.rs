//! # Broadcast Bus
//!
//! Same-device, cross-tab fan-out. One bus per process, shared by every store.
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Broadcast Bus                                    │
//! │                                                                         │
//! │  Tab A store ── flush ──► BroadcastEnvelope ──┐                        │
//! │                                               │ tokio broadcast        │
//! │                          ┌────────────────────┼───────────────────┐    │
//! │                          ▼                    ▼                   ▼    │
//! │                    Tab A store          Tab B store         Tab C store│
//! │                    (self origin,        (same entity,       (other     │
//! │                     dropped)             applied)            entity,   │
//! │                                                              ignored)  │
//! │                                                                         │
//! │  No ack, no retry. A receiver that lags simply misses messages; the    │
//! │  event log and resync fill the gap.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use tally_core::{ScopeTags, SyncEvent};

/// Name of the process-wide bus.
pub const BROADCAST_CHANNEL_NAME: &str = "tally-sync";

/// Default bus buffer size.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

// =============================================================================
// Envelope
// =============================================================================

/// A `SyncEvent` plus the sender's full state after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub channel: String,
    pub entity_id: String,
    pub origin: String,
    pub version: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,

    /// The sender's full snapshot.
    pub state: Value,

    #[serde(flatten)]
    pub scope: ScopeTags,
    pub created_at: DateTime<Utc>,
}

impl BroadcastEnvelope {
    pub fn new(event: &SyncEvent, state: Value) -> Self {
        BroadcastEnvelope {
            channel: event.channel.clone(),
            entity_id: event.entity_id.clone(),
            origin: event.origin.clone(),
            version: event.version,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            state,
            scope: event.scope.clone(),
            created_at: event.created_at,
        }
    }

    /// Cheap pre-filter applied before anything else.
    pub fn is_for(&self, channel: &str, entity_id: &str) -> bool {
        self.channel == channel && self.entity_id == entity_id
    }

    /// The event part, without the snapshot.
    pub fn event(&self) -> SyncEvent {
        SyncEvent {
            channel: self.channel.clone(),
            entity_id: self.entity_id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            version: self.version,
            origin: self.origin.clone(),
            scope: self.scope.clone(),
            created_at: self.created_at,
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Cloneable handle to the process-wide bus.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BroadcastEnvelope>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastBus { tx }
    }

    pub fn name(&self) -> &'static str {
        BROADCAST_CHANNEL_NAME
    }

    /// Publishes to every open receiver. Returns how many received it.
    pub fn publish(&self, envelope: BroadcastEnvelope) -> usize {
        trace!(
            channel = %envelope.channel,
            entity_id = %envelope.entity_id,
            version = envelope.version,
            "Publishing on broadcast bus"
        );
        // No receivers is not an error
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEnvelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        BroadcastBus::new(DEFAULT_BROADCAST_CAPACITY)
    }
}
