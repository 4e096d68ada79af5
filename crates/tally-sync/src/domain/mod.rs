//! # Domain Stores
//!
//! Aggregates of the point-of-sale back office, each a [`SyncedStore`] with
//! its own merge strategy and actions.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Domain Stores                                  │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐      │
//! │  │ InventoryStore   │  │ CashSessionStore │  │ LoyaltyStore     │      │
//! │  │ "inventory"      │  │ "cash_session"   │  │ "loyalty"        │      │
//! │  │                  │  │                  │  │                  │      │
//! │  │ stock.delta: sum │  │ session.sale:    │  │ loyalty.adjust:  │      │
//! │  │                  │  │   sum            │  │   sum, committed │      │
//! │  │                  │  │ session.close:   │  │                  │      │
//! │  │                  │  │   replace        │  │                  │      │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘      │
//! │                                                                         │
//! │  Nothing runs until start(): it opens the store, attaches the push     │
//! │  listener and the resync trigger. stop() tears all three down.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod cash_session;
pub mod inventory;
pub mod loyalty;

pub use cash_session::{CashSession, CashSessionStore, SessionStatus};
pub use inventory::{InventoryStore, StockLevels};
pub use loyalty::{LoyaltyBalance, LoyaltyStore};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use tally_core::{EntityKey, MergeStrategy};

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::push::PushListener;
use crate::resync::ResyncTrigger;
use crate::store::{StoreConfig, StoreData, SyncedStore};

struct Running<T> {
    store: SyncedStore<T>,
    push: PushListener,
    trigger: ResyncTrigger,
}

/// Lifecycle shared by every domain store.
pub struct DomainStore<T> {
    ctx: SyncContext,
    config: StoreConfig,
    initial: T,
    strategy: Arc<dyn MergeStrategy>,
    running: Mutex<Option<Running<T>>>,
}

impl<T: StoreData> DomainStore<T> {
    /// Prepares a store. Spawns nothing.
    pub fn new(ctx: &SyncContext, config: StoreConfig, initial: T, strategy: Arc<dyn MergeStrategy>) -> Self {
        DomainStore {
            ctx: ctx.clone(),
            config,
            initial,
            strategy,
            running: Mutex::new(None),
        }
    }

    pub fn key(&self) -> EntityKey {
        self.config.key()
    }

    /// Opens the store and attaches push and resync. Calling it again while
    /// running is a no-op.
    pub fn start(&self) -> SyncResult<SyncedStore<T>> {
        let mut running = self.running();
        if let Some(current) = running.as_ref() {
            return Ok(current.store.clone());
        }

        let store = SyncedStore::open(&self.ctx, self.config.clone(), self.initial.clone(), self.strategy.clone())?;
        let push = PushListener::attach(&store, self.ctx.registry.clone());
        let trigger = ResyncTrigger::attach(&store, self.ctx.registry.clone(), &self.ctx.connectivity);

        info!(entity = %store.key(), "Domain store started");
        *running = Some(Running {
            store: store.clone(),
            push,
            trigger,
        });
        Ok(store)
    }

    /// Detaches push and resync and destroys the store. The persisted slot
    /// stays.
    pub fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.push.detach();
        running.trigger.detach();
        running.store.destroy();
        info!(entity = %self.config.key(), "Domain store stopped");
    }

    pub fn is_started(&self) -> bool {
        self.running().is_some()
    }

    /// The running store, or `NotStarted`.
    pub fn store(&self) -> SyncResult<SyncedStore<T>> {
        self.running()
            .as_ref()
            .map(|running| running.store.clone())
            .ok_or_else(|| SyncError::NotStarted(self.config.key().to_string()))
    }

    fn running(&self) -> MutexGuard<'_, Option<Running<T>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for DomainStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EventLog, MemoryEventLog};
    use crate::slot::MemorySlotStore;
    use serde_json::json;
    use std::time::Duration;
    use tally_core::{BuiltinStrategy, Origin, SyncEvent};

    #[tokio::test(start_paused = true)]
    async fn test_nothing_runs_before_start() {
        let log = Arc::new(MemoryEventLog::new());
        let ctx = SyncContext::new(Origin::new("dev-1", "tab"), log.clone(), Arc::new(MemorySlotStore::new()));
        let domain = DomainStore::new(
            &ctx,
            StoreConfig::new("counter", "c-1"),
            json!({}),
            Arc::new(BuiltinStrategy::Default),
        );

        assert!(!domain.is_started());
        assert!(matches!(domain.store(), Err(SyncError::NotStarted(_))));
        assert_eq!(ctx.bus.receiver_count(), 0);

        let store = domain.start().unwrap();
        let again = domain.start().unwrap();
        assert_eq!(ctx.bus.receiver_count(), 1);

        let remote = SyncEvent::new(&domain.key(), "state.patch", json!({ "a": 1 }), 1, "dev-2:tab");
        log.append(&remote).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(again.data(), json!({ "a": 1 }));

        domain.stop();
        domain.stop();
        assert!(store.is_destroyed());
        assert!(!domain.is_started());
    }
}
