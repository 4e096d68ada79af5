//! # Origin Derivation
//!
//! Host helper that builds an [`Origin`] from persisted slots.
//!
//! ```text
//! device id   `sync:device_id` in durable slots, generated on first use
//! tab id      `sync:tab_id` in session slots, generated once per session
//! ```
//!
//! The session store lives exactly as long as the tab: a `MemorySlotStore`
//! held by the host for one process, or any store the host clears when the
//! session ends. Stores never call this themselves; the origin is always
//! passed in.

use tally_core::Origin;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::slot::{device_id_key, tab_id_key, SlotStore};

/// Builds origins from slot storage.
pub trait OriginFromSlots: Sized {
    /// Loads or creates the device id in `durable` and the tab id in
    /// `session`.
    fn from_slots(durable: &dyn SlotStore, session: &dyn SlotStore) -> SyncResult<Self>;
}

impl OriginFromSlots for Origin {
    fn from_slots(durable: &dyn SlotStore, session: &dyn SlotStore) -> SyncResult<Self> {
        let device_id = load_or_create(durable, &device_id_key())?;
        let tab_id = load_or_create(session, &tab_id_key())?;
        Ok(Origin::new(device_id, tab_id))
    }
}

fn load_or_create(slots: &dyn SlotStore, key: &str) -> SyncResult<String> {
    if let Some(id) = slots.get(key)? {
        let id = id.trim();
        if !id.is_empty() {
            debug!(key, id, "Reusing stored id");
            return Ok(id.to_string());
        }
    }

    let id = Uuid::new_v4().to_string();
    slots.set(key, &id)?;
    info!(key, id = %id, "Generated id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::MemorySlotStore;

    #[test]
    fn test_tab_id_lives_for_one_session() {
        let durable = MemorySlotStore::new();
        let session = MemorySlotStore::new();

        let first = Origin::from_slots(&durable, &session).unwrap();
        let same_tab = Origin::from_slots(&durable, &session).unwrap();
        assert_eq!(first, same_tab);
        assert!(first.is_self(same_tab.token()));

        let next_session = MemorySlotStore::new();
        let other_tab = Origin::from_slots(&durable, &next_session).unwrap();
        assert_eq!(first.device_id(), other_tab.device_id());
        assert_ne!(first.tab_id(), other_tab.tab_id());
        assert!(first.is_same_device(other_tab.token()));
        assert!(!first.is_self(other_tab.token()));

        assert_eq!(durable.len(), 1);
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_existing_ids_are_reused() {
        let durable = MemorySlotStore::new();
        let session = MemorySlotStore::new();
        durable.set("sync:device_id", "register-7").unwrap();
        session.set("sync:tab_id", "  ").unwrap();

        let origin = Origin::from_slots(&durable, &session).unwrap();
        assert_eq!(origin.device_id(), "register-7");
        assert!(!origin.tab_id().is_empty());
        assert_eq!(session.get("sync:tab_id").unwrap().as_deref(), Some(origin.tab_id()));
    }
}
