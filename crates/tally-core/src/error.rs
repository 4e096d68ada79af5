//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Merge and snapshot failures                    │
//! │  └── ValidationError  - Identifier validation failures                 │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Event log failures                             │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - What store consumers see                       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → on_error / caller     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by pure sync logic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A patch or incoming payload was not a JSON object.
    ///
    /// ## When This Occurs
    /// - `set_state` called with a scalar or array
    /// - A remote event carries a non-object payload for a shallow merge
    #[error("Patch must be a JSON object, got {kind}")]
    InvalidPatch { kind: String },

    /// A merge strategy could not combine local and incoming state.
    ///
    /// ## When This Occurs
    /// - A delta event tries to add a number onto a non-numeric field
    /// - A delta sum overflows `i64`
    ///
    /// The inbound path reports this through `on_error` and leaves the
    /// watermark where it was.
    #[error("Merge failed for '{event_type}': {reason}")]
    MergeFailed { event_type: String, reason: String },

    /// A merged snapshot does not deserialize into the store's data type.
    #[error("Snapshot does not match the store's data shape: {0}")]
    SnapshotMismatch(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a MergeFailed error.
    pub fn merge_failed(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MergeFailed {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Identifier validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., separator characters in an id).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::merge_failed("stock.delta", "field 'qty' is not a number");
        assert_eq!(
            err.to_string(),
            "Merge failed for 'stock.delta': field 'qty' is not a number"
        );

        let err = CoreError::InvalidPatch {
            kind: "array".to_string(),
        };
        assert_eq!(err.to_string(), "Patch must be a JSON object, got array");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "channel".to_string(),
        };
        assert_eq!(err.to_string(), "channel is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "entity_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
