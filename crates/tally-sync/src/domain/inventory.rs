//! # Inventory
//!
//! Stock levels per SKU for one store location.
//!
//! `stock.delta` events accumulate numbers inside `levels`; every other type
//! uses the default strategy.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use tally_core::{BuiltinStrategy, TypeDispatch};

use super::DomainStore;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::store::SyncedStore;

pub const INVENTORY_CHANNEL: &str = "inventory";

/// Event type of stock adjustments.
pub const EVENT_STOCK_DELTA: &str = "stock.delta";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    #[serde(default)]
    pub levels: BTreeMap<String, i64>,
}

impl StockLevels {
    pub fn level(&self, sku: &str) -> i64 {
        self.levels.get(sku).copied().unwrap_or(0)
    }
}

pub fn inventory_strategy() -> TypeDispatch {
    TypeDispatch::new().route(EVENT_STOCK_DELTA, BuiltinStrategy::DeltaAccumulate)
}

/// Stock levels of one location.
#[derive(Debug)]
pub struct InventoryStore {
    inner: DomainStore<StockLevels>,
}

impl InventoryStore {
    pub fn new(ctx: &SyncContext, location_id: &str) -> SyncResult<Self> {
        let config = ctx.store_config(INVENTORY_CHANNEL, location_id)?;
        Ok(InventoryStore {
            inner: DomainStore::new(ctx, config, StockLevels::default(), Arc::new(inventory_strategy())),
        })
    }

    pub fn start(&self) -> SyncResult<SyncedStore<StockLevels>> {
        self.inner.start()
    }

    pub fn stop(&self) {
        self.inner.stop()
    }

    pub fn store(&self) -> SyncResult<SyncedStore<StockLevels>> {
        self.inner.store()
    }

    pub fn levels(&self) -> SyncResult<StockLevels> {
        Ok(self.inner.store()?.data())
    }

    /// Sets the absolute level of one SKU.
    pub fn set_stock(&self, sku: &str, quantity: i64) -> SyncResult<()> {
        let store = self.inner.store()?;
        let mut levels = store.data().levels;
        levels.insert(sku.to_string(), quantity);
        store.set_state(json!({ "levels": levels }))
    }

    /// Moves one SKU's level by `delta`.
    ///
    /// The event carries the new absolute levels tagged `stock.delta`, and
    /// the inventory strategy adds `stock.delta` payloads. Another origin
    /// applying it therefore adds the absolute level onto its own.
    pub fn adjust_stock(&self, sku: &str, delta: i64) -> SyncResult<()> {
        let store = self.inner.store()?;
        let mut levels = store.data().levels;
        let next = levels.get(sku).copied().unwrap_or(0) + delta;
        levels.insert(sku.to_string(), next);

        // TODO: decide between sending `{ sku: delta }` via apply_delta and
        // routing stock.delta to ShallowPatch; until then remote origins double-count.
        store.set_state_with_type(json!({ "levels": levels }), EVENT_STOCK_DELTA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastBus;
    use crate::error::SyncError;
    use crate::log::MemoryEventLog;
    use crate::slot::MemorySlotStore;
    use std::time::Duration;
    use tally_core::Origin;

    fn context(tab: &str, log: Arc<MemoryEventLog>, bus: &BroadcastBus) -> SyncContext {
        SyncContext::new(Origin::new("dev-1", tab), log, Arc::new(MemorySlotStore::new())).with_bus(bus.clone())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_require_start() {
        let log = Arc::new(MemoryEventLog::new());
        let inventory = InventoryStore::new(&context("tab-a", log, &BroadcastBus::default()), "store-001").unwrap();

        assert!(matches!(inventory.set_stock("COKE-330", 4), Err(SyncError::NotStarted(_))));

        inventory.start().unwrap();
        inventory.set_stock("COKE-330", 4).unwrap();
        assert_eq!(inventory.levels().unwrap().level("COKE-330"), 4);
        inventory.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_stock_sends_absolute_level_as_delta() {
        let log = Arc::new(MemoryEventLog::new());
        let bus = BroadcastBus::default();
        let tab_a = InventoryStore::new(&context("tab-a", log.clone(), &bus), "store-001").unwrap();
        let tab_b = InventoryStore::new(&context("tab-b", log.clone(), &bus), "store-001").unwrap();
        tab_a.start().unwrap();
        tab_b.start().unwrap();

        tab_a.set_stock("COKE-330", 10).unwrap();
        settle().await;
        assert_eq!(tab_b.levels().unwrap().level("COKE-330"), 10);

        tab_a.adjust_stock("COKE-330", 2).unwrap();
        settle().await;

        let events = log.events();
        let adjust = events.iter().find(|e| e.event_type == EVENT_STOCK_DELTA).unwrap();
        assert_eq!(adjust.payload, json!({ "levels": { "COKE-330": 12 } }));

        // Known inconsistency: the absolute level is added on the other tab
        assert_eq!(tab_a.levels().unwrap().level("COKE-330"), 12);
        assert_eq!(tab_b.levels().unwrap().level("COKE-330"), 22);
    }

    #[test]
    fn test_strategy_sums_stock_delta_only() {
        use tally_core::MergeStrategy;

        let strategy = inventory_strategy();
        let local = json!({ "levels": { "A": 3, "B": 1 } });

        let summed = strategy.merge(&local, &json!({ "levels": { "A": 2 } }), EVENT_STOCK_DELTA).unwrap();
        assert_eq!(summed, json!({ "levels": { "A": 5, "B": 1 } }));
        assert!(strategy.is_cumulative(EVENT_STOCK_DELTA));

        let patched = strategy.merge(&local, &json!({ "levels": { "A": 2 } }), "state.patch").unwrap();
        assert_eq!(patched, json!({ "levels": { "A": 2 } }));
    }
}
