//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Event Log     │  │     Apply               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  VersionConflict│  │  Core (merge failed)    │ │
//! │  │  MissingDeviceId│  │  DatabaseError  │  │  SerializationFailed    │ │
//! │  │  ConfigLoad/Save│  │  LogUnavailable │  │  ApplyInProgress        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Slots        │  │    Lifecycle    │  │      Domain             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  SlotFailed     │  │  StoreDestroyed │  │  InsufficientPoints     │ │
//! │  │                 │  │  NotStarted     │  │  InvalidTransition      │ │
//! │  │                 │  │  NoRuntime      │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tally_core::{CoreError, ValidationError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Event Log Errors
    // =========================================================================
    /// The event log already holds this version of the entity.
    ///
    /// ## When This Occurs
    /// Two origins flushed against the same watermark. The log keeps the
    /// first writer; the loser's local state stays as it is.
    #[error("Version conflict for {channel}/{entity_id}: version {version} already written")]
    VersionConflict {
        channel: String,
        entity_id: String,
        version: i64,
    },

    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Event log rejected the operation (network down, injected failure).
    #[error("Event log unavailable: {0}")]
    LogUnavailable(String),

    /// Push feed could not be opened.
    #[error("Push subscription failed for channel '{channel}': {reason}")]
    SubscriptionFailed { channel: String, reason: String },

    // =========================================================================
    // Apply Errors
    // =========================================================================
    /// Merge or validation failure from tally-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Failed to (de)serialize a snapshot or payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A strongly-acknowledged write was attempted while an inbound event
    /// was being applied.
    #[error("Store {0} is applying an inbound event")]
    ApplyInProgress(String),

    // =========================================================================
    // Slot Errors
    // =========================================================================
    /// Persisted slot read or write failed.
    #[error("Persisted slot '{key}' failed: {reason}")]
    SlotFailed { key: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The store was destroyed.
    #[error("Store {0} has been destroyed")]
    StoreDestroyed(String),

    /// A domain store action was called before `start()`.
    #[error("Store {0} is not started")]
    NotStarted(String),

    /// A store was opened outside a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// A loyalty adjustment would make the balance negative.
    #[error("Insufficient points: balance {available}, adjustment {requested}")]
    InsufficientPoints { available: i64, requested: i64 },

    /// A domain action is not valid in the aggregate's current state.
    #[error("Invalid transition: cannot {action} while {state}")]
    InvalidTransition { action: String, state: String },
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Creates a SlotFailed error.
    pub fn slot(key: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::SlotFailed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the next trigger (online transition, resync pass)
    /// could succeed without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::DatabaseError(_)
                | SyncError::LogUnavailable(_)
                | SyncError::SubscriptionFailed { .. }
                | SyncError::SlotFailed { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error comes from a merge strategy.
    pub fn is_merge_error(&self) -> bool {
        matches!(
            self,
            SyncError::Core(CoreError::MergeFailed { .. })
                | SyncError::Core(CoreError::InvalidPatch { .. })
                | SyncError::Core(CoreError::SnapshotMismatch(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::LogUnavailable("offline".into()).is_retryable());
        assert!(SyncError::DatabaseError("locked".into()).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::MissingDeviceId.is_retryable());
        assert!(!SyncError::InsufficientPoints {
            available: 5,
            requested: -10
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::VersionConflict {
            channel: "inventory".into(),
            entity_id: "store-001".into(),
            version: 7,
        };
        assert!(err.to_string().contains("inventory/store-001"));
        assert!(err.to_string().contains("7"));
    }

    #[test]
    fn test_merge_error_category() {
        let err: SyncError = CoreError::merge_failed("stock.delta", "overflow").into();
        assert!(err.is_merge_error());
        assert!(!err.is_config_error());
    }
}
