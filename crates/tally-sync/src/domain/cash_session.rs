//! # Cash Session
//!
//! The open/close cycle of one register's cash drawer.
//!
//! ```text
//!   Idle ──open(float)──► Open ──close()──► Closed ──open(float)──► Open
//!                          │  ▲
//!                          └──┘ record_sale(amount)
//! ```
//!
//! Sales from several tabs add up (`session.sale` accumulates). Closing is
//! committed to the event log and replaces the whole session everywhere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use tally_core::{BuiltinStrategy, TypeDispatch};

use super::DomainStore;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::store::SyncedStore;

pub const CASH_SESSION_CHANNEL: &str = "cash_session";

pub const EVENT_SESSION_OPEN: &str = "session.open";
pub const EVENT_SESSION_SALE: &str = "session.sale";
pub const EVENT_SESSION_CLOSE: &str = "session.close";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Open,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Open => write!(f, "open"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CashSession {
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub opening_float_cents: i64,
    #[serde(default)]
    pub sales_total_cents: i64,
    #[serde(default)]
    pub sale_count: i64,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl CashSession {
    /// Float plus sales.
    pub fn expected_cash_cents(&self) -> i64 {
        self.opening_float_cents + self.sales_total_cents
    }
}

pub fn cash_session_strategy() -> TypeDispatch {
    TypeDispatch::new()
        .route(EVENT_SESSION_SALE, BuiltinStrategy::DeltaAccumulate)
        .route(EVENT_SESSION_CLOSE, BuiltinStrategy::FullReplace)
}

/// Cash session of one register.
#[derive(Debug)]
pub struct CashSessionStore {
    inner: DomainStore<CashSession>,
}

impl CashSessionStore {
    pub fn new(ctx: &SyncContext, register_id: &str) -> SyncResult<Self> {
        let config = ctx.store_config(CASH_SESSION_CHANNEL, register_id)?;
        Ok(CashSessionStore {
            inner: DomainStore::new(ctx, config, CashSession::default(), Arc::new(cash_session_strategy())),
        })
    }

    pub fn start(&self) -> SyncResult<SyncedStore<CashSession>> {
        self.inner.start()
    }

    pub fn stop(&self) {
        self.inner.stop()
    }

    pub fn session(&self) -> SyncResult<CashSession> {
        Ok(self.inner.store()?.data())
    }

    pub fn open(&self, opening_float_cents: i64) -> SyncResult<()> {
        let store = self.inner.store()?;
        let session = store.data();
        if session.status == SessionStatus::Open {
            return Err(invalid("open", session.status));
        }
        if opening_float_cents < 0 {
            return Err(SyncError::InvalidTransition {
                action: "open with a negative float".into(),
                state: session.status.to_string(),
            });
        }

        store.set_state_with_type(
            json!({
                "status": SessionStatus::Open,
                "opening_float_cents": opening_float_cents,
                "sales_total_cents": 0,
                "sale_count": 0,
                "opened_at": Utc::now(),
                "closed_at": null,
            }),
            EVENT_SESSION_OPEN,
        )?;
        info!(entity = %store.key(), opening_float_cents, "Cash session opened");
        Ok(())
    }

    pub fn record_sale(&self, amount_cents: i64) -> SyncResult<()> {
        let store = self.inner.store()?;
        let status = store.data().status;
        if status != SessionStatus::Open {
            return Err(invalid("record a sale", status));
        }

        store.apply_delta(
            json!({ "sales_total_cents": amount_cents, "sale_count": 1 }),
            EVENT_SESSION_SALE,
        )
    }

    /// Closes the session. Waits for the event log; on failure the session
    /// stays open and the error is returned.
    pub async fn close(&self) -> SyncResult<CashSession> {
        let store = self.inner.store()?;
        let mut session = store.data();
        if session.status != SessionStatus::Open {
            return Err(invalid("close", session.status));
        }

        session.status = SessionStatus::Closed;
        session.closed_at = Some(Utc::now());
        let version = store
            .commit(serde_json::to_value(&session)?, EVENT_SESSION_CLOSE)
            .await?;

        info!(
            entity = %store.key(),
            version,
            sales_total_cents = session.sales_total_cents,
            sale_count = session.sale_count,
            "Cash session closed"
        );
        Ok(store.data())
    }
}

fn invalid(action: &str, status: SessionStatus) -> SyncError {
    SyncError::InvalidTransition {
        action: action.to_string(),
        state: status.to_string(),
    }
}
