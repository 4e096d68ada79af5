//! # Resync
//!
//! Catch-up from the event log after reload, reconnection or a lagged push
//! feed.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Resync Pass                                    │
//! │                                                                         │
//! │  1. claim (channel, entity_id) in the registry ── taken? AlreadyRunning│
//! │  2. since = max(watermark, override)                                   │
//! │  3. events_since(channel, entity_id, since) ── error? empty report     │
//! │  4. replay ascending through apply_inbound                             │
//! │       Applied     applied += 1                                         │
//! │       Stale/Self  skipped += 1                                         │
//! │       Err         failed_at = version, stop                            │
//! │  5. release the claim                                                  │
//! │                                                                         │
//! │  Replaying the same range twice changes nothing: the version gate      │
//! │  drops everything at or below the watermark.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggering
//! [`ResyncTrigger`] runs a pass once on attach when online, then on every
//! offline to online transition of the host's [`Connectivity`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tally_core::EntityKey;

use crate::context::Connectivity;
use crate::store::{ApplyOutcome, StoreData, SyncedStore};

// =============================================================================
// Report
// =============================================================================

/// What one resync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Lower bound used for the query (exclusive).
    pub since: i64,
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
    /// Version whose application failed; later events were not attempted.
    pub failed_at: Option<i64>,
}

impl ResyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    Completed(ResyncReport),
    /// Another pass for the same entity was in flight.
    AlreadyRunning,
}

impl ResyncOutcome {
    pub fn report(&self) -> Option<&ResyncReport> {
        match self {
            ResyncOutcome::Completed(report) => Some(report),
            ResyncOutcome::AlreadyRunning => None,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Entities with a resync in flight. Shared by every trigger in a process.
#[derive(Debug, Clone, Default)]
pub struct ResyncRegistry {
    running: Arc<Mutex<HashSet<EntityKey>>>,
}

impl ResyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`. `None` if it is already claimed.
    pub fn try_begin(&self, key: &EntityKey) -> Option<ResyncGuard> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(key.clone()) {
            return None;
        }
        Some(ResyncGuard {
            running: self.running.clone(),
            key: key.clone(),
        })
    }

    pub fn is_running(&self, key: &EntityKey) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub struct ResyncGuard {
    running: Arc<Mutex<HashSet<EntityKey>>>,
    key: EntityKey,
}

impl Drop for ResyncGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

// =============================================================================
// Resync Pass
// =============================================================================

/// Replays log events above the store's watermark.
///
/// A query failure is reported to the store's emitter and yields an empty
/// report; nothing is applied and the watermark stays where it was.
pub async fn resync<T: StoreData>(
    store: &SyncedStore<T>,
    registry: &ResyncRegistry,
    since_override: Option<i64>,
) -> ResyncOutcome {
    let key = store.key().clone();
    let Some(_claim) = registry.try_begin(&key) else {
        debug!(entity = %key, "Resync already running");
        return ResyncOutcome::AlreadyRunning;
    };

    let watermark = store.version();
    let since = since_override.map_or(watermark, |v| v.max(watermark));
    let mut report = ResyncReport {
        since,
        ..ResyncReport::default()
    };

    let mut events = match store.log().events_since(&key.channel, &key.entity_id, since).await {
        Ok(events) => events,
        Err(e) => {
            warn!(entity = %key, since, error = %e, "Resync query failed");
            store.emitter().emit_error(&key, &e);
            return ResyncOutcome::Completed(report);
        }
    };
    events.sort_by_key(|event| event.version);
    report.fetched = events.len();

    for event in &events {
        match store.apply_inbound(event, None) {
            Ok(ApplyOutcome::Applied) => report.applied += 1,
            Ok(ApplyOutcome::Destroyed) => break,
            Ok(_) => report.skipped += 1,
            Err(_) => {
                // Reconsidered on the next pass
                report.failed_at = Some(event.version);
                break;
            }
        }
    }

    info!(
        entity = %key,
        since,
        fetched = report.fetched,
        applied = report.applied,
        skipped = report.skipped,
        failed_at = ?report.failed_at,
        "Resync finished"
    );
    ResyncOutcome::Completed(report)
}

// =============================================================================
// Trigger
// =============================================================================

/// Runs resync on attach and on every reconnect.
///
/// Also mirrors connectivity into the store's state. Dropping the trigger
/// detaches it.
#[must_use = "the trigger detaches when dropped"]
#[derive(Debug)]
pub struct ResyncTrigger {
    task: JoinHandle<()>,
}

impl ResyncTrigger {
    pub fn attach<T: StoreData>(store: &SyncedStore<T>, registry: ResyncRegistry, connectivity: &Connectivity) -> Self {
        let mut rx = connectivity.subscribe();
        let weak = store.downgrade();
        let key = store.key().clone();

        let task = store.runtime().spawn(async move {
            let mut online = *rx.borrow_and_update();
            match weak.upgrade() {
                Some(store) => {
                    store.set_online(online);
                    if online {
                        resync(&store, &registry, None).await;
                    }
                }
                None => return,
            }

            while rx.changed().await.is_ok() {
                let now = *rx.borrow_and_update();
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if store.is_destroyed() {
                    break;
                }

                store.set_online(now);
                if now && !online {
                    debug!(entity = %key, "Back online, resyncing");
                    resync(&store, &registry, None).await;
                }
                online = now;
            }
        });

        ResyncTrigger { task }
    }

    pub fn detach(self) {
        self.task.abort();
    }
}

impl Drop for ResyncTrigger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
