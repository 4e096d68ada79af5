//! # Event Log
//!
//! The durable, append-only source of truth for resync, plus the push feed
//! that tells other origins about new rows.
//!
//! ## Adapters
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EventLog trait                                   │
//! │                                                                         │
//! │   append(event)                  one row per outbound event            │
//! │   events_since(ch, id, v)        version > v, ascending                │
//! │   subscribe(ch)                  push feed for one channel             │
//! │                                                                         │
//! │  ┌──────────────────────────┐      ┌──────────────────────────────┐    │
//! │  │ SqliteEventLog           │      │ MemoryEventLog               │    │
//! │  │ tally-db sync_events     │      │ Vec<SyncEvent>               │    │
//! │  │ + PushFeed               │      │ + PushFeed                   │    │
//! │  │                          │      │ + failure injection          │    │
//! │  └──────────────────────────┘      └──────────────────────────────┘    │
//! │                                                                         │
//! │  The feed is filled only after a successful append.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tally_core::SyncEvent;
use tally_db::{Database, DbError};

use crate::error::{SyncError, SyncResult};

/// Default per-channel push buffer.
pub const DEFAULT_PUSH_CAPACITY: usize = 256;

// =============================================================================
// Trait
// =============================================================================

/// Durable event log with a per-channel push feed.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends one event. Fails with `VersionConflict` if the version of
    /// that entity was already written.
    async fn append(&self, event: &SyncEvent) -> SyncResult<()>;

    /// Events of one entity with `version > since`, ascending.
    async fn events_since(&self, channel: &str, entity_id: &str, since: i64) -> SyncResult<Vec<SyncEvent>>;

    /// Opens the push feed for a channel.
    fn subscribe(&self, channel: &str) -> SyncResult<broadcast::Receiver<SyncEvent>>;
}

// =============================================================================
// Push Feed
// =============================================================================

/// One broadcast sender per channel, created lazily.
#[derive(Debug)]
pub struct PushFeed {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<SyncEvent>>>,
}

impl PushFeed {
    pub fn new(capacity: usize) -> Self {
        PushFeed {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, channel: &str) -> SyncResult<broadcast::Receiver<SyncEvent>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|e| SyncError::SubscriptionFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }

    /// Notifies subscribers of `event.channel`. Returns receiver count.
    pub fn notify(&self, event: &SyncEvent) -> usize {
        let channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => return 0,
        };
        match channels.get(&event.channel) {
            Some(tx) => tx.send(event.clone()).unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for PushFeed {
    fn default() -> Self {
        PushFeed::new(DEFAULT_PUSH_CAPACITY)
    }
}

// =============================================================================
// In-Memory Log
// =============================================================================

/// Event log kept in memory.
///
/// Enforces the same uniqueness rule as the SQLite table. Failure switches
/// simulate an unreachable log.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<SyncEvent>>,
    feed: PushFeed,
    fail_appends: AtomicBool,
    fail_queries: AtomicBool,
    appends: AtomicUsize,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_push_capacity(capacity: usize) -> Self {
        MemoryEventLog {
            feed: PushFeed::new(capacity),
            ..Self::default()
        }
    }

    /// Makes every following `append` fail (or succeed again).
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Makes every following `events_since` fail (or succeed again).
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Number of successful appends.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Copy of every stored event, in insertion order.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stores an event without notifying the push feed, as if this origin
    /// had been offline when it was written.
    pub fn backfill(&self, event: SyncEvent) -> SyncResult<()> {
        self.insert(&event)
    }

    fn insert(&self, event: &SyncEvent) -> SyncResult<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| SyncError::LogUnavailable(e.to_string()))?;

        let taken = events.iter().any(|e| {
            e.channel == event.channel && e.entity_id == event.entity_id && e.version == event.version
        });
        if taken {
            return Err(SyncError::VersionConflict {
                channel: event.channel.clone(),
                entity_id: event.entity_id.clone(),
                version: event.version,
            });
        }

        events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &SyncEvent) -> SyncResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(SyncError::LogUnavailable("append rejected".into()));
        }

        self.insert(event)?;
        self.appends.fetch_add(1, Ordering::SeqCst);

        let notified = self.feed.notify(event);
        trace!(channel = %event.channel, version = event.version, notified, "Appended to memory log");
        Ok(())
    }

    async fn events_since(&self, channel: &str, entity_id: &str, since: i64) -> SyncResult<Vec<SyncEvent>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(SyncError::LogUnavailable("query rejected".into()));
        }

        let events = self
            .events
            .lock()
            .map_err(|e| SyncError::LogUnavailable(e.to_string()))?;

        let mut found: Vec<SyncEvent> = events
            .iter()
            .filter(|e| e.channel == channel && e.entity_id == entity_id && e.version > since)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.version);
        Ok(found)
    }

    fn subscribe(&self, channel: &str) -> SyncResult<broadcast::Receiver<SyncEvent>> {
        self.feed.subscribe(channel)
    }
}

// =============================================================================
// SQLite Log
// =============================================================================

/// Event log backed by the `sync_events` table.
#[derive(Debug)]
pub struct SqliteEventLog {
    db: Database,
    feed: PushFeed,
}

impl SqliteEventLog {
    pub fn new(db: Database) -> Self {
        Self::with_push_capacity(db, DEFAULT_PUSH_CAPACITY)
    }

    pub fn with_push_capacity(db: Database, capacity: usize) -> Self {
        SqliteEventLog {
            db,
            feed: PushFeed::new(capacity),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, event: &SyncEvent) -> SyncResult<()> {
        match self.db.sync_events().insert(event).await {
            Ok(row_id) => {
                let notified = self.feed.notify(event);
                debug!(
                    channel = %event.channel,
                    entity_id = %event.entity_id,
                    version = event.version,
                    row_id,
                    notified,
                    "Appended to event log"
                );
                Ok(())
            }
            Err(DbError::UniqueViolation { .. }) => Err(SyncError::VersionConflict {
                channel: event.channel.clone(),
                entity_id: event.entity_id.clone(),
                version: event.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn events_since(&self, channel: &str, entity_id: &str, since: i64) -> SyncResult<Vec<SyncEvent>> {
        Ok(self.db.sync_events().list_since(channel, entity_id, since).await?)
    }

    fn subscribe(&self, channel: &str) -> SyncResult<broadcast::Receiver<SyncEvent>> {
        self.feed.subscribe(channel)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::EntityKey;
    use tally_db::DbConfig;

    fn event(entity: &str, version: i64) -> SyncEvent {
        SyncEvent::new(
            &EntityKey::new("inventory", entity),
            "state.patch",
            json!({ "v": version }),
            version,
            "dev:tab",
        )
    }

    #[tokio::test]
    async fn test_memory_log_rejects_reused_version() {
        let log = MemoryEventLog::new();
        log.append(&event("store-001", 1)).await.unwrap();

        let err = log.append(&event("store-001", 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionConflict { version: 1, .. }));

        // Same version of another entity is fine
        log.append(&event("store-002", 1)).await.unwrap();
        assert_eq!(log.append_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_log_query_is_sorted_and_filtered() {
        let log = MemoryEventLog::new();
        log.backfill(event("store-001", 3)).unwrap();
        log.backfill(event("store-001", 1)).unwrap();
        log.backfill(event("store-001", 2)).unwrap();
        log.backfill(event("store-002", 9)).unwrap();

        let found = log.events_since("inventory", "store-001", 1).await.unwrap();
        assert_eq!(found.iter().map(|e| e.version).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_push_feed_only_after_append() {
        let log = MemoryEventLog::new();
        let mut rx = log.subscribe("inventory").unwrap();
        let mut other = log.subscribe("loyalty").unwrap();

        log.backfill(event("store-001", 1)).unwrap();
        log.append(&event("store-001", 2)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().version, 2);
        assert!(rx.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let log = MemoryEventLog::new();
        log.fail_appends(true);
        assert!(log.append(&event("store-001", 1)).await.unwrap_err().is_retryable());
        assert_eq!(log.append_count(), 0);

        log.fail_queries(true);
        assert!(log.events_since("inventory", "store-001", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_log_append_query_and_push() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let log = SqliteEventLog::new(db);
        let mut rx = log.subscribe("inventory").unwrap();

        log.append(&event("store-001", 1)).await.unwrap();
        log.append(&event("store-001", 2)).await.unwrap();

        let err = log.append(&event("store-001", 2)).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionConflict { version: 2, .. }));

        let found = log.events_since("inventory", "store-001", 0).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].payload, json!({ "v": 2 }));

        assert_eq!(rx.recv().await.unwrap().version, 1);
        assert_eq!(rx.recv().await.unwrap().version, 2);
        assert!(rx.try_recv().is_err());
    }
}
