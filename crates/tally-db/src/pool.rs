//! # Event Log Database
//!
//! Opens the SQLite file behind the sync event log.
//!
//! ## Access Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      sync_events access                                 │
//! │                                                                         │
//! │   writers                              readers                          │
//! │   ───────                              ───────                          │
//! │   outbound append (background)         resync: version > watermark      │
//! │   commit append (awaited)              seed / maintenance counts        │
//! │          │                                      │                       │
//! │          └──────────────┬───────────────────────┘                       │
//! │                         ▼                                               │
//! │              SqlitePool (WAL, busy timeout)                             │
//! │                                                                         │
//! │  Appends are single-row inserts; a writer waiting on another writer    │
//! │  sleeps up to `busy_timeout` instead of failing with SQLITE_BUSY.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::events::SyncEventRepository;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Where the event log lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    /// Private to the pool; gone when it closes.
    Memory,
}

/// Event log database settings.
///
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/tally/sync.db").max_connections(2);
/// let db = Database::new(config).await?;
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub location: DbLocation,

    /// Ignored for in-memory databases, which need exactly one connection.
    pub max_connections: u32,

    /// How long a write waits for a competing writer.
    pub busy_timeout: Duration,

    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            location: DbLocation::File(path.into()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            run_migrations: true,
        }
    }

    /// A throwaway log for tests and single-process demos.
    pub fn in_memory() -> Self {
        DbConfig {
            location: DbLocation::Memory,
            ..DbConfig::new(PathBuf::new())
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn pool_size(&self) -> u32 {
        match self.location {
            DbLocation::Memory => 1,
            DbLocation::File(_) => self.max_connections.max(1),
        }
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = match &self.location {
            DbLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?,
            DbLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                // May lose the last append on power loss; resync covers that gap
                .synchronous(SqliteSynchronous::Normal),
        };
        Ok(options.busy_timeout(self.busy_timeout))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the event log database. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    location: DbLocation,
}

impl Database {
    /// Opens (creating if needed) the database and applies migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let options = config.connect_options()?;
        let pool_size = config.pool_size();

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        match &config.location {
            DbLocation::File(path) => info!(path = %path.display(), pool_size, "Event log database opened"),
            DbLocation::Memory => debug!("In-memory event log database opened"),
        }

        let db = Database {
            pool,
            location: config.location,
        };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Idempotent.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// File backing the log, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            DbLocation::File(path) => Some(path),
            DbLocation::Memory => None,
        }
    }

    pub fn sync_events(&self) -> SyncEventRepository {
        SyncEventRepository::new(self.pool.clone())
    }

    /// Closes the pool. Later queries fail.
    pub async fn close(&self) {
        info!("Closing event log database");
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{EntityKey, SyncEvent};
    use uuid::Uuid;

    fn event(version: i64) -> SyncEvent {
        SyncEvent::new(
            &EntityKey::new("inventory", "store-001"),
            "stock.delta",
            serde_json::json!({ "levels": { "COKE-330": 1 } }),
            version,
            "dev-1:tab-a",
        )
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory().max_connections(8)).await.unwrap();

        assert!(db.health_check().await);
        assert!(db.path().is_none());
    }

    #[tokio::test]
    async fn test_closed_database_is_unhealthy() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;

        assert!(!db.health_check().await);
    }

    #[tokio::test]
    async fn test_file_log_survives_reopen() {
        let path = std::env::temp_dir().join(format!("tally-sync-{}.db", Uuid::new_v4()));

        let db = Database::new(DbConfig::new(&path).max_connections(2)).await.unwrap();
        db.sync_events().insert(&event(1)).await.unwrap();
        db.close().await;

        let reopened = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        assert_eq!(
            reopened.sync_events().latest_version("inventory", "store-001").await.unwrap(),
            1
        );
        reopened.close().await;

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memory_uses_a_single_connection() {
        assert_eq!(DbConfig::in_memory().max_connections(8).pool_size(), 1);
        assert_eq!(DbConfig::new("/tmp/sync.db").max_connections(0).pool_size(), 1);
        assert_eq!(DbConfig::new("/tmp/sync.db").max_connections(3).pool_size(), 3);
    }
}
