//! # Sync Types
//!
//! Core types that flow through every layer of the sync engine.
//!
//! ## Type Relationships
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Types                                      │
//! │                                                                         │
//! │  ┌─────────────────┐         fold by          ┌─────────────────┐      │
//! │  │   SyncEvent     │  ─────────────────────►  │  SyncState<T>   │      │
//! │  │  ─────────────  │     version order        │  ─────────────  │      │
//! │  │  channel        │                          │  data: T        │      │
//! │  │  entity_id      │                          │  version        │      │
//! │  │  type           │                          │  last_sync      │      │
//! │  │  payload (JSON) │                          │  is_online      │      │
//! │  │  version        │                          └─────────────────┘      │
//! │  │  origin         │                                                    │
//! │  │  scope tags     │     EntityKey = (channel, entity_id)               │
//! │  └─────────────────┘     one SyncState per EntityKey per tab            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::SLOT_NAMESPACE;

// =============================================================================
// Entity Key
// =============================================================================

/// Identifies one replicated aggregate: `(channel, entity_id)`.
///
/// Each key is an independent replication unit. Ordering between two
/// different keys is unspecified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub channel: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(channel: impl Into<String>, entity_id: impl Into<String>) -> Self {
        EntityKey {
            channel: channel.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Prefix shared by every persisted slot key of this entity.
    ///
    /// `sync:{channel}:{entity_id}`
    pub fn slot_prefix(&self) -> String {
        format!("{}:{}:{}", SLOT_NAMESPACE, self.channel, self.entity_id)
    }

    /// Returns true if the event belongs to this entity.
    pub fn matches(&self, channel: &str, entity_id: &str) -> bool {
        self.channel == channel && self.entity_id == entity_id
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.entity_id)
    }
}

// =============================================================================
// Origin
// =============================================================================

/// Compound device + tab identity of an event author.
///
/// Used solely to suppress self-echo. Never used for ordering.
///
/// ## Derivation
/// ```text
/// device_id  survives across sessions (persisted once per device)
/// tab_id     lives for one session only
/// token      "{device_id}:{tab_id}"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    device_id: String,
    tab_id: String,
    token: String,
}

impl Origin {
    /// Creates an origin from ids supplied by the host environment.
    pub fn new(device_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let tab_id = tab_id.into();
        let token = format!("{}:{}", device_id, tab_id);
        Origin {
            device_id,
            tab_id,
            token,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// The token stamped into `SyncEvent::origin`.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns true if `origin` was authored by this device + tab.
    pub fn is_self(&self, origin: &str) -> bool {
        self.token == origin
    }

    /// Returns true if `origin` was authored on the same device (any tab).
    pub fn is_same_device(&self, origin: &str) -> bool {
        origin
            .split_once(':')
            .map(|(device, _)| device == self.device_id)
            .unwrap_or(false)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.token)
    }
}

// =============================================================================
// Scope Tags
// =============================================================================

/// Advisory tags narrowing multi-location deployments.
///
/// Not part of the ordering invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ScopeTags {
    /// Branch (store location) id.
    #[serde(default)]
    pub branch_id: Option<String>,

    /// Point-of-sale register id.
    #[serde(default)]
    pub pos_id: Option<String>,
}

impl ScopeTags {
    pub fn branch(branch_id: impl Into<String>) -> Self {
        ScopeTags {
            branch_id: Some(branch_id.into()),
            pos_id: None,
        }
    }

    pub fn with_pos(mut self, pos_id: impl Into<String>) -> Self {
        self.pos_id = Some(pos_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.branch_id.is_none() && self.pos_id.is_none()
    }
}

// =============================================================================
// Sync Event
// =============================================================================

/// The unit of replication.
///
/// ## Wire Format
/// ```json
/// {
///   "channel": "inventory",
///   "entity_id": "store-001",
///   "type": "stock.delta",
///   "payload": { "levels": { "COKE-330": 5 } },
///   "version": 12,
///   "origin": "device-uuid:tab-uuid",
///   "branch_id": "downtown",
///   "pos_id": null,
///   "created_at": "2026-01-01T10:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncEvent {
    /// Logical topic, e.g. "inventory", "cash_session".
    pub channel: String,

    /// Aggregate instance within the channel.
    pub entity_id: String,

    /// Mutation semantics tag, selects the merge behavior.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Partial or full snapshot of the aggregate.
    #[ts(type = "unknown")]
    pub payload: Value,

    /// Strictly increasing per `(channel, entity_id)`, never reused.
    pub version: i64,

    /// Author token (`device:tab`). Loop suppression only.
    pub origin: String,

    /// Advisory scope tags.
    #[serde(flatten)]
    pub scope: ScopeTags,

    /// Informational timestamp.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl SyncEvent {
    /// Creates an event stamped with the current time and no scope tags.
    pub fn new(
        key: &EntityKey,
        event_type: impl Into<String>,
        payload: Value,
        version: i64,
        origin: impl Into<String>,
    ) -> Self {
        SyncEvent {
            channel: key.channel.clone(),
            entity_id: key.entity_id.clone(),
            event_type: event_type.into(),
            payload,
            version,
            origin: origin.into(),
            scope: ScopeTags::default(),
            created_at: Utc::now(),
        }
    }

    /// Attaches scope tags.
    pub fn with_scope(mut self, scope: ScopeTags) -> Self {
        self.scope = scope;
        self
    }

    /// Returns the entity this event belongs to.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.channel.clone(), self.entity_id.clone())
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Runtime view of one aggregate held by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState<T> {
    /// Current merged snapshot.
    pub data: T,

    /// Last applied version (the watermark).
    pub version: i64,

    /// When the last inbound event was applied.
    pub last_sync: Option<DateTime<Utc>>,

    /// Host-reported connectivity.
    pub is_online: bool,
}

impl<T> SyncState<T> {
    /// Fresh state at version 0.
    pub fn new(data: T) -> Self {
        SyncState {
            data,
            version: 0,
            last_sync: None,
            is_online: true,
        }
    }
}

impl<T: Default> Default for SyncState<T> {
    fn default() -> Self {
        SyncState::new(T::default())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_origin_token() {
        let origin = Origin::new("dev-1", "tab-9");
        assert_eq!(origin.token(), "dev-1:tab-9");
        assert!(origin.is_self("dev-1:tab-9"));
        assert!(!origin.is_self("dev-1:tab-2"));
        assert!(origin.is_same_device("dev-1:tab-2"));
        assert!(!origin.is_same_device("dev-2:tab-9"));
    }

    #[test]
    fn test_slot_prefix() {
        let key = EntityKey::new("inventory", "store-001");
        assert_eq!(key.slot_prefix(), "sync:inventory:store-001");
        assert_eq!(key.to_string(), "inventory/store-001");
    }

    #[test]
    fn test_event_wire_format() {
        let key = EntityKey::new("cash_session", "reg-1");
        let event = SyncEvent::new(&key, "session.close", json!({ "status": "closed" }), 4, "d:t")
            .with_scope(ScopeTags::branch("downtown").with_pos("reg-1"));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "session.close");
        assert_eq!(value["branch_id"], "downtown");
        assert_eq!(value["pos_id"], "reg-1");
        assert_eq!(value["version"], 4);

        let back: SyncEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_without_scope_tags_deserializes() {
        let value = json!({
            "channel": "loyalty",
            "entity_id": "cust-7",
            "type": "state.patch",
            "payload": { "points": 10 },
            "version": 1,
            "origin": "d:t",
            "created_at": "2026-01-01T10:00:00Z"
        });
        let event: SyncEvent = serde_json::from_value(value).unwrap();
        assert!(event.scope.is_empty());
    }

    #[test]
    fn test_sync_state_default() {
        let state: SyncState<i64> = SyncState::default();
        assert_eq!(state.version, 0);
        assert!(state.last_sync.is_none());
        assert!(state.is_online);
    }
}
