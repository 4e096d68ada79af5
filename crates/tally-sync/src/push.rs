//! # Remote Push Listener
//!
//! Cross-device propagation. Listens to the event log's per-channel feed and
//! applies rows written by other origins through the store's version gate.
//!
//! ```text
//! EventLog::subscribe(channel)
//!        │
//!        ▼
//!   entity_id matches? ──no──► ignore
//!        │
//!        ▼
//!   apply_inbound(event)       own origin / stale: dropped by the gate
//!
//!   Lagged(n) ──► resync the entity (the log holds what was missed)
//! ```

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tally_core::{EntityKey, SyncEvent};

use crate::resync::{resync, ResyncRegistry};
use crate::store::{StoreData, SyncedStore, WeakStore};

/// Push feed subscription of one store. Dropping it detaches.
#[must_use = "the listener detaches when dropped"]
#[derive(Debug)]
pub struct PushListener {
    key: EntityKey,
    task: Option<JoinHandle<()>>,
}

impl PushListener {
    /// Subscribes `store` to its channel's push feed.
    ///
    /// A subscription failure goes to the store's emitter; the returned
    /// listener is then inert.
    pub fn attach<T: StoreData>(store: &SyncedStore<T>, registry: ResyncRegistry) -> Self {
        let key = store.key().clone();

        let rx = match store.log().subscribe(&key.channel) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(entity = %key, error = %e, "Push subscription failed");
                store.emitter().emit_error(&key, &e);
                return PushListener { key, task: None };
            }
        };

        let task = store.runtime().spawn(push_loop(store.downgrade(), rx, registry));
        info!(entity = %key, "Push listener attached");
        PushListener { key, task: Some(task) }
    }

    pub fn is_attached(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    pub fn detach(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(entity = %self.key, "Push listener detached");
        }
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn push_loop<T: StoreData>(weak: WeakStore<T>, mut rx: broadcast::Receiver<SyncEvent>, registry: ResyncRegistry) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if store.is_destroyed() {
                    break;
                }
                if event.entity_id != store.key().entity_id {
                    continue;
                }
                // Failures already went to the emitter
                let _ = store.apply_inbound(&event, None);
            }
            Err(RecvError::Lagged(skipped)) => {
                let Some(store) = weak.upgrade() else {
                    break;
                };
                warn!(entity = %store.key(), skipped, "Push feed lagged, resyncing");
                let registry = registry.clone();
                let runtime = store.runtime().clone();
                runtime.spawn(async move {
                    resync(&store, &registry, None).await;
                });
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyncContext;
    use crate::error::{SyncError, SyncResult};
    use crate::log::{EventLog, MemoryEventLog};
    use crate::slot::{MemorySlotStore, SlotStore};
    use crate::store::StoreConfig;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tally_core::{BuiltinStrategy, Origin};

    fn event(entity: &str, version: i64, origin: &str, payload: Value) -> SyncEvent {
        SyncEvent::new(&EntityKey::new("counter", entity), "state.patch", payload, version, origin)
    }

    fn open(ctx: &SyncContext) -> SyncedStore<Value> {
        SyncedStore::open(ctx, StoreConfig::new("counter", "c-1"), json!({}), Arc::new(BuiltinStrategy::Default)).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_applies_remote_rows_for_this_entity() {
        let log = Arc::new(MemoryEventLog::new());
        let ctx = SyncContext::new(Origin::new("dev-1", "tab"), log.clone(), Arc::new(MemorySlotStore::new()));
        let store = open(&ctx);
        let listener = PushListener::attach(&store, ctx.registry.clone());
        assert!(listener.is_attached());

        log.append(&event("c-1", 1, "dev-2:tab", json!({ "a": 1 }))).await.unwrap();
        log.append(&event("c-2", 2, "dev-2:tab", json!({ "a": 99 }))).await.unwrap();
        log.append(&event("c-1", 2, "dev-1:tab", json!({ "a": 50 }))).await.unwrap();
        settle().await;

        assert_eq!(store.data(), json!({ "a": 1 }));
        assert_eq!(store.version(), 1);

        listener.detach();
        log.append(&event("c-1", 3, "dev-2:tab", json!({ "a": 3 }))).await.unwrap();
        settle().await;
        assert_eq!(store.version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_watermark_blocks_replay() {
        let log = Arc::new(MemoryEventLog::new());
        let slots = MemorySlotStore::new();
        slots.set("sync:counter:c-1:state", r#"{"a":5}"#).unwrap();
        slots.set("sync:counter:c-1:version", "5").unwrap();
        let ctx = SyncContext::new(Origin::new("dev-1", "tab"), log.clone(), Arc::new(slots));

        let store = open(&ctx);
        let _listener = PushListener::attach(&store, ctx.registry.clone());

        log.append(&event("c-1", 4, "dev-2:tab", json!({ "a": 4 }))).await.unwrap();
        settle().await;
        assert_eq!(store.data(), json!({ "a": 5 }));

        log.append(&event("c-1", 6, "dev-2:tab", json!({ "a": 6 }))).await.unwrap();
        settle().await;
        assert_eq!(store.data(), json!({ "a": 6 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagged_feed_falls_back_to_resync() {
        let log = Arc::new(MemoryEventLog::with_push_capacity(1));
        let ctx = SyncContext::new(Origin::new("dev-1", "tab"), log.clone(), Arc::new(MemorySlotStore::new()));
        let store = open(&ctx);
        let _listener = PushListener::attach(&store, ctx.registry.clone());

        for v in 1..=4 {
            log.append(&event("c-1", v, "dev-2:tab", json!({ "a": v }))).await.unwrap();
        }
        settle().await;

        assert_eq!(store.version(), 4);
        assert_eq!(store.data(), json!({ "a": 4 }));
    }

    struct ClosedLog;

    #[async_trait]
    impl EventLog for ClosedLog {
        async fn append(&self, _event: &SyncEvent) -> SyncResult<()> {
            Ok(())
        }

        async fn events_since(&self, _channel: &str, _entity_id: &str, _since: i64) -> SyncResult<Vec<SyncEvent>> {
            Ok(Vec::new())
        }

        fn subscribe(&self, channel: &str) -> SyncResult<broadcast::Receiver<SyncEvent>> {
            Err(SyncError::SubscriptionFailed {
                channel: channel.to_string(),
                reason: "feed closed".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_is_reported() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let ctx = SyncContext::new(Origin::new("dev-1", "tab"), Arc::new(ClosedLog), Arc::new(MemorySlotStore::new()))
            .with_emitter(Arc::new(move |_: &EntityKey, e: &SyncError| sink.lock().unwrap().push(e.is_retryable())));
        let store = open(&ctx);

        let listener = PushListener::attach(&store, ctx.registry.clone());

        assert!(!listener.is_attached());
        assert_eq!(*errors.lock().unwrap(), vec![true]);
    }
}
