//! # Loyalty
//!
//! Point balance of one customer. Adjustments are committed: a caller never
//! sees a balance change the event log did not accept.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use tally_core::{BuiltinStrategy, TypeDispatch};

use super::DomainStore;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::store::SyncedStore;

pub const LOYALTY_CHANNEL: &str = "loyalty";

pub const EVENT_LOYALTY_ADJUST: &str = "loyalty.adjust";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyBalance {
    #[serde(default)]
    pub points: i64,
}

pub fn loyalty_strategy() -> TypeDispatch {
    TypeDispatch::new().route(EVENT_LOYALTY_ADJUST, BuiltinStrategy::DeltaAccumulate)
}

/// Loyalty balance of one customer.
#[derive(Debug)]
pub struct LoyaltyStore {
    inner: DomainStore<LoyaltyBalance>,
}

impl LoyaltyStore {
    pub fn new(ctx: &SyncContext, customer_id: &str) -> SyncResult<Self> {
        let config = ctx.store_config(LOYALTY_CHANNEL, customer_id)?;
        Ok(LoyaltyStore {
            inner: DomainStore::new(ctx, config, LoyaltyBalance::default(), Arc::new(loyalty_strategy())),
        })
    }

    pub fn start(&self) -> SyncResult<SyncedStore<LoyaltyBalance>> {
        self.inner.start()
    }

    pub fn stop(&self) {
        self.inner.stop()
    }

    pub fn balance(&self) -> SyncResult<LoyaltyBalance> {
        Ok(self.inner.store()?.data())
    }

    /// Adds `delta` points (negative to redeem) and returns the new balance.
    ///
    /// A redemption beyond the balance is rejected before anything is
    /// written. If the event log rejects the adjustment the balance is
    /// rolled back and the error returned.
    pub async fn adjust_points(&self, delta: i64) -> SyncResult<LoyaltyBalance> {
        let store = self.inner.store()?;
        let available = store.data().points;
        if available + delta < 0 {
            return Err(SyncError::InsufficientPoints {
                available,
                requested: delta,
            });
        }

        match store.commit(json!({ "points": delta }), EVENT_LOYALTY_ADJUST).await {
            Ok(version) => {
                debug!(entity = %store.key(), delta, version, "Points adjusted");
                Ok(store.data())
            }
            Err(e) => {
                warn!(entity = %store.key(), delta, error = %e, "Points adjustment rolled back");
                Err(e)
            }
        }
    }
}
