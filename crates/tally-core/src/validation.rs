//! # Validation Module
//!
//! Identifier rules for channels, entity ids and event types.
//!
//! ## Why Identifiers Are Restricted
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Identifiers end up in three places:                                   │
//! │                                                                         │
//! │  1. Persisted slot keys   sync:{channel}:{entity_id}:state             │
//! │  2. Slot file names       one file per key on disk                     │
//! │  3. Event log rows        channel / entity_id / type columns           │
//! │                                                                         │
//! │  ':' would break (1), '/' and '\' would break (2).                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_channel, validate_entity_id};
//!
//! validate_channel("inventory").unwrap();
//! validate_entity_id("store-001").unwrap();
//! assert!(validate_entity_id("a:b").is_err());
//! ```

use crate::error::ValidationError;
use crate::{MAX_ENTITY_ID_LEN, MAX_TAG_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a channel name.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Lowercase letters, digits, underscores and hyphens only
pub fn validate_channel(channel: &str) -> ValidationResult<()> {
    require_non_empty("channel", channel)?;
    require_max_len("channel", channel, MAX_TAG_LEN)?;

    if !channel
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidFormat {
            field: "channel".to_string(),
            reason: "must contain only lowercase letters, digits, underscores, and hyphens".to_string(),
        });
    }

    Ok(())
}

/// Validates an entity id.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - No whitespace, ':' or path separators
pub fn validate_entity_id(entity_id: &str) -> ValidationResult<()> {
    require_non_empty("entity_id", entity_id)?;
    require_max_len("entity_id", entity_id, MAX_ENTITY_ID_LEN)?;

    if entity_id
        .chars()
        .any(|c| c.is_whitespace() || c == ':' || c == '/' || c == '\\')
    {
        return Err(ValidationError::InvalidFormat {
            field: "entity_id".to_string(),
            reason: "must not contain whitespace, ':' or path separators".to_string(),
        });
    }

    Ok(())
}

/// Validates an event type tag such as `stock.delta`.
pub fn validate_event_type(event_type: &str) -> ValidationResult<()> {
    require_non_empty("event type", event_type)?;
    require_max_len("event type", event_type, MAX_TAG_LEN)?;

    if !event_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidFormat {
            field: "event type".to_string(),
            reason: "must contain only letters, digits, '.', '_' and '-'".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a version number (non-negative).
pub fn validate_version(version: i64) -> ValidationResult<()> {
    if version < 0 {
        return Err(ValidationError::OutOfRange {
            field: "version".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn require_max_len(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_channel() {
        assert!(validate_channel("inventory").is_ok());
        assert!(validate_channel("cash_session").is_ok());
        assert!(validate_channel("").is_err());
        assert!(validate_channel("Inventory").is_err());
        assert!(validate_channel("inv:x").is_err());
        assert!(validate_channel(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_entity_id() {
        assert!(validate_entity_id("store-001").is_ok());
        assert!(validate_entity_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_entity_id("  ").is_err());
        assert!(validate_entity_id("a b").is_err());
        assert!(validate_entity_id("../etc").is_err());
        assert!(validate_entity_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_event_type() {
        assert!(validate_event_type("stock.delta").is_ok());
        assert!(validate_event_type("state.patch").is_ok());
        assert!(validate_event_type("stock delta").is_err());
        assert!(validate_event_type("").is_err());
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version(0).is_ok());
        assert!(validate_version(42).is_ok());
        assert!(validate_version(-1).is_err());
    }
}
