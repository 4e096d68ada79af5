//! # Persisted Slots
//!
//! Durable per-entity storage of the last-known snapshot, the watermark and
//! the last-sync timestamp. Survives reloads; outlives every store.
//!
//! ## Key Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Slot Keys                                       │
//! │                                                                         │
//! │  sync:{channel}:{entity_id}:state      JSON snapshot                   │
//! │  sync:{channel}:{entity_id}:version    last applied version            │
//! │  sync:{channel}:{entity_id}:last_sync  RFC 3339 timestamp              │
//! │  sync:device_id                        durable device identity         │
//! │                                                                         │
//! │  Only the store that owns (channel, entity_id) in this process         │
//! │  writes its three keys.                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use tally_core::{EntityKey, SLOT_NAMESPACE};

use crate::error::{SyncError, SyncResult};

/// Key holding the durable device id.
pub fn device_id_key() -> String {
    format!("{}:device_id", SLOT_NAMESPACE)
}

/// Key holding the tab id in session-scoped storage.
pub fn tab_id_key() -> String {
    format!("{}:tab_id", SLOT_NAMESPACE)
}

// =============================================================================
// Slot Store Trait
// =============================================================================

/// Synchronous string key/value storage.
///
/// Reads and writes never suspend: `set_state` persists before it returns.
pub trait SlotStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// In-memory slots. Lost on process exit.
#[derive(Debug, Clone, Default)]
pub struct MemorySlotStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SlotStore for MemorySlotStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let entries = self.entries.lock().map_err(|e| SyncError::slot(key, e))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let mut entries = self.entries.lock().map_err(|e| SyncError::slot(key, e))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let mut entries = self.entries.lock().map_err(|e| SyncError::slot(key, e))?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written snapshot behind.
#[derive(Debug, Clone)]
pub struct FileSlotStore {
    dir: PathBuf,
}

impl FileSlotStore {
    /// Opens (and creates if needed) a slot directory.
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SyncError::slot(dir.display().to_string(), e))?;
        debug!(dir = %dir.display(), "Opened slot directory");
        Ok(FileSlotStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Identifiers never contain ':' or path separators, so this is unique
        self.dir.join(format!("{}.slot", key.replace(':', ".")))
    }
}

impl SlotStore for FileSlotStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::slot(key, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("slot.tmp");
        std::fs::write(&tmp, value).map_err(|e| SyncError::slot(key, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| SyncError::slot(key, e))
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::slot(key, e)),
        }
    }
}

// =============================================================================
// Persisted Slot
// =============================================================================

/// What a slot held at rehydration time.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSnapshot {
    pub data: Option<Value>,
    pub version: i64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// The three keys of one entity.
#[derive(Clone)]
pub struct PersistedSlot {
    slots: Arc<dyn SlotStore>,
    state_key: String,
    version_key: String,
    last_sync_key: String,
}

impl PersistedSlot {
    pub fn new(slots: Arc<dyn SlotStore>, key: &EntityKey) -> Self {
        let prefix = key.slot_prefix();
        PersistedSlot {
            slots,
            state_key: format!("{}:state", prefix),
            version_key: format!("{}:version", prefix),
            last_sync_key: format!("{}:last_sync", prefix),
        }
    }

    /// Reads the slot.
    ///
    /// A corrupt snapshot is reported as missing together with version 0, so
    /// the next resync rebuilds the entity from the log.
    pub fn load(&self) -> SyncResult<SlotSnapshot> {
        let data = match self.slots.get(&self.state_key)? {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %self.state_key, error = %e, "Discarding corrupt slot snapshot");
                    return Ok(SlotSnapshot {
                        data: None,
                        version: 0,
                        last_sync: None,
                    });
                }
            },
            None => None,
        };

        let version = self
            .slots
            .get(&self.version_key)?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0);

        let last_sync = self
            .slots
            .get(&self.last_sync_key)?
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(SlotSnapshot {
            data,
            version,
            last_sync,
        })
    }

    /// Writes snapshot, watermark and timestamp.
    pub fn save(&self, data: &Value, version: i64, last_sync: Option<DateTime<Utc>>) -> SyncResult<()> {
        let raw = serde_json::to_string(data)?;
        self.slots.set(&self.state_key, &raw)?;
        self.slots.set(&self.version_key, &version.to_string())?;
        match last_sync {
            Some(ts) => self.slots.set(&self.last_sync_key, &ts.to_rfc3339())?,
            None => self.slots.remove(&self.last_sync_key)?,
        }
        Ok(())
    }

    /// Removes all three keys.
    pub fn clear(&self) -> SyncResult<()> {
        self.slots.remove(&self.state_key)?;
        self.slots.remove(&self.version_key)?;
        self.slots.remove(&self.last_sync_key)
    }
}

impl std::fmt::Debug for PersistedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedSlot")
            .field("state_key", &self.state_key)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
