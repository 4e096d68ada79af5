//! # Sync Event Repository
//!
//! Append-only storage for every outbound `SyncEvent`.
//!
//! ## Log Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    sync_events (one entity)                             │
//! │                                                                         │
//! │  version │ type          │ payload                │ origin             │
//! │  ────────┼───────────────┼────────────────────────┼─────────────────── │
//! │     1    │ state.replace │ {"levels":{"A":10}}    │ dev-1:tab-1        │
//! │     2    │ stock.delta   │ {"levels":{"A":-2}}    │ dev-2:tab-7        │
//! │     3    │ state.patch   │ {"note":"recount"}     │ dev-1:tab-1        │
//! │                                                                         │
//! │  UNIQUE(channel, entity_id, version): a version is never reused.       │
//! │  Resync reads `version > watermark ORDER BY version ASC`.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows are never updated. `prune_before` is the only delete path and is
//! meant for compaction once every replica has moved past a version.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{ScopeTags, SyncEvent};

/// Raw row as stored in SQLite.
#[derive(Debug, FromRow)]
struct EventRow {
    channel: String,
    entity_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    payload: String,
    version: i64,
    origin: String,
    branch_id: Option<String>,
    pos_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for SyncEvent {
    type Error = DbError;

    fn try_from(row: EventRow) -> DbResult<Self> {
        let payload = serde_json::from_str(&row.payload).map_err(|e| DbError::InvalidPayload {
            channel: row.channel.clone(),
            entity_id: row.entity_id.clone(),
            version: row.version,
            reason: e.to_string(),
        })?;

        Ok(SyncEvent {
            channel: row.channel,
            entity_id: row.entity_id,
            event_type: row.event_type,
            payload,
            version: row.version,
            origin: row.origin,
            scope: ScopeTags {
                branch_id: row.branch_id,
                pos_id: row.pos_id,
            },
            created_at: row.created_at,
        })
    }
}

/// Repository for the sync event log.
#[derive(Debug, Clone)]
pub struct SyncEventRepository {
    pool: SqlitePool,
}

impl SyncEventRepository {
    /// Creates a new SyncEventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncEventRepository { pool }
    }

    /// Appends an event to the log.
    ///
    /// ## Errors
    /// - `UniqueViolation` if `(channel, entity_id, version)` already exists
    /// - `Internal` if the payload cannot be serialized
    ///
    /// ## Returns
    /// The row id of the inserted event.
    pub async fn insert(&self, event: &SyncEvent) -> DbResult<i64> {
        let payload =
            serde_json::to_string(&event.payload).map_err(|e| DbError::Internal(e.to_string()))?;

        debug!(
            channel = %event.channel,
            entity_id = %event.entity_id,
            version = event.version,
            event_type = %event.event_type,
            "Appending sync event"
        );

        let result = sqlx::query(
            r#"
            INSERT INTO sync_events (
                channel, entity_id, type, payload, version,
                origin, branch_id, pos_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&event.channel)
        .bind(&event.entity_id)
        .bind(&event.event_type)
        .bind(payload)
        .bind(event.version)
        .bind(&event.origin)
        .bind(&event.scope.branch_id)
        .bind(&event.scope.pos_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate(
                "version",
                format!("{}/{} v{}", event.channel, event.entity_id, event.version),
            ),
            other => other,
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Lists events of one entity with `version > since`, ascending.
    ///
    /// ## Example
    /// ```rust,ignore
    /// // Watermark is 12: fetch 13, 14, ...
    /// let missed = repo.list_since("inventory", "store-001", 12).await?;
    /// ```
    pub async fn list_since(
        &self,
        channel: &str,
        entity_id: &str,
        since: i64,
    ) -> DbResult<Vec<SyncEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT channel, entity_id, type, payload, version,
                   origin, branch_id, pos_id, created_at
            FROM sync_events
            WHERE channel = ?1 AND entity_id = ?2 AND version > ?3
            ORDER BY version ASC
            "#,
        )
        .bind(channel)
        .bind(entity_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        debug!(
            channel = %channel,
            entity_id = %entity_id,
            since = since,
            count = rows.len(),
            "Loaded events since watermark"
        );

        rows.into_iter().map(SyncEvent::try_from).collect()
    }

    /// Returns the highest stored version for an entity, or 0 if none.
    pub async fn latest_version(&self, channel: &str, entity_id: &str) -> DbResult<i64> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM sync_events WHERE channel = ?1 AND entity_id = ?2",
        )
        .bind(channel)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(latest.unwrap_or(0))
    }

    /// Counts stored events for an entity.
    pub async fn count_for_entity(&self, channel: &str, entity_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_events WHERE channel = ?1 AND entity_id = ?2",
        )
        .bind(channel)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Deletes events of an entity with `version < before`.
    ///
    /// ## Returns
    /// Number of rows removed.
    pub async fn prune_before(&self, channel: &str, entity_id: &str, before: i64) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_events WHERE channel = ?1 AND entity_id = ?2 AND version < ?3",
        )
        .bind(channel)
        .bind(entity_id)
        .bind(before)
        .execute(&self.pool)
        .await?;

        debug!(
            channel = %channel,
            entity_id = %entity_id,
            before = before,
            removed = result.rows_affected(),
            "Pruned sync events"
        );

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;
    use tally_core::EntityKey;

    async fn test_repo() -> SyncEventRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sync_events()
    }

    fn event(entity: &str, version: i64, payload: serde_json::Value) -> SyncEvent {
        SyncEvent::new(
            &EntityKey::new("inventory", entity),
            "stock.delta",
            payload,
            version,
            "dev-1:tab-1",
        )
    }

    #[tokio::test]
    async fn test_insert_and_list_since_in_order() {
        let repo = test_repo().await;

        // Out of order on purpose
        repo.insert(&event("store-001", 2, json!({ "levels": { "A": -1 } }))).await.unwrap();
        repo.insert(&event("store-001", 1, json!({ "levels": { "A": 10 } }))).await.unwrap();
        repo.insert(&event("store-001", 3, json!({ "levels": { "A": 4 } }))).await.unwrap();

        let all = repo.list_since("inventory", "store-001", 0).await.unwrap();
        let versions: Vec<i64> = all.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let missed = repo.list_since("inventory", "store-001", 1).await.unwrap();
        assert_eq!(missed.len(), 2);
        assert_eq!(missed[0].version, 2);
        assert_eq!(missed[0].payload, json!({ "levels": { "A": -1 } }));
    }

    #[tokio::test]
    async fn test_list_since_is_scoped_to_entity() {
        let repo = test_repo().await;

        repo.insert(&event("store-001", 1, json!({}))).await.unwrap();
        repo.insert(&event("store-002", 1, json!({}))).await.unwrap();

        let events = repo.list_since("inventory", "store-002", 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, "store-002");
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let repo = test_repo().await;

        repo.insert(&event("store-001", 1, json!({}))).await.unwrap();
        let err = repo.insert(&event("store-001", 1, json!({}))).await.unwrap_err();

        assert!(matches!(err, DbError::UniqueViolation { .. }));
        assert_eq!(repo.count_for_entity("inventory", "store-001").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scope_tags_round_trip() {
        let repo = test_repo().await;
        let tagged = event("store-001", 1, json!({ "x": 1 }))
            .with_scope(ScopeTags::branch("downtown").with_pos("reg-2"));

        repo.insert(&tagged).await.unwrap();

        let stored = repo.list_since("inventory", "store-001", 0).await.unwrap();
        assert_eq!(stored[0].scope.branch_id.as_deref(), Some("downtown"));
        assert_eq!(stored[0].scope.pos_id.as_deref(), Some("reg-2"));
        assert_eq!(stored[0].event_type, "stock.delta");
    }

    #[tokio::test]
    async fn test_latest_version() {
        let repo = test_repo().await;
        assert_eq!(repo.latest_version("inventory", "store-001").await.unwrap(), 0);

        repo.insert(&event("store-001", 1, json!({}))).await.unwrap();
        repo.insert(&event("store-001", 5, json!({}))).await.unwrap();

        assert_eq!(repo.latest_version("inventory", "store-001").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_prune_before() {
        let repo = test_repo().await;
        for v in 1..=5 {
            repo.insert(&event("store-001", v, json!({}))).await.unwrap();
        }

        let removed = repo.prune_before("inventory", "store-001", 4).await.unwrap();
        assert_eq!(removed, 3);

        let left = repo.list_since("inventory", "store-001", 0).await.unwrap();
        assert_eq!(left.iter().map(|e| e.version).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_corrupt_payload_reported() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        sqlx::query(
            "INSERT INTO sync_events (channel, entity_id, type, payload, version, origin, created_at)
             VALUES ('inventory', 'store-001', 'state.patch', '{not json', 1, 'd:t', ?1)",
        )
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let err = db
            .sync_events()
            .list_since("inventory", "store-001", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidPayload { version: 1, .. }));
    }
}
