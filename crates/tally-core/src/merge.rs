//! # Merge Strategies
//!
//! Pure functions combining a store's local snapshot with an incoming one.
//!
//! ## Dispatch
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Merge Strategy Dispatch                              │
//! │                                                                         │
//! │   merge(local, incoming, event_type) -> merged                         │
//! │                                                                         │
//! │   The dispatch key is the EVENT TYPE, not the channel, so one store    │
//! │   can mix replace and delta semantics:                                 │
//! │                                                                         │
//! │   "state.replace" ──► FullReplace      return incoming verbatim        │
//! │   "state.patch"   ──► ShallowPatch     incoming keys over local        │
//! │   "stock.delta"   ──► DeltaAccumulate  local + incoming, per number    │
//! │                                                                         │
//! │   TypeDispatch routes tags to strategies with a fallback.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cumulative Types
//! A cumulative strategy must see the event's own payload (the delta), never
//! the sender's full snapshot. `is_cumulative` tells the inbound path which one
//! to hand over.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use crate::error::{CoreError, CoreResult};
use crate::EVENT_STATE_REPLACE;

// =============================================================================
// Strategy Trait
// =============================================================================

/// A pure `(local, incoming, event_type) -> merged` function.
pub trait MergeStrategy: Send + Sync {
    /// Combines `incoming` into `local` for an event of type `event_type`.
    fn merge(&self, local: &Value, incoming: &Value, event_type: &str) -> CoreResult<Value>;

    /// Returns true if events of this type carry deltas rather than state.
    fn is_cumulative(&self, _event_type: &str) -> bool {
        false
    }
}

impl<S: MergeStrategy + ?Sized> MergeStrategy for Arc<S> {
    fn merge(&self, local: &Value, incoming: &Value, event_type: &str) -> CoreResult<Value> {
        (**self).merge(local, incoming, event_type)
    }

    fn is_cumulative(&self, event_type: &str) -> bool {
        (**self).is_cumulative(event_type)
    }
}

/// Returns true for tags that denote a full-snapshot replacement.
pub fn is_full_replacement(event_type: &str) -> bool {
    event_type == EVENT_STATE_REPLACE
        || event_type.ends_with(".replace")
        || event_type.ends_with(".snapshot")
}

// =============================================================================
// Shallow Merge
// =============================================================================

/// Copies every top-level key of `patch` over `local`.
///
/// A non-object `local` (e.g. `null` before the first write) is treated as an
/// empty object. A non-object `patch` is rejected.
pub fn shallow_merge(local: &Value, patch: &Value) -> CoreResult<Value> {
    let patch = as_object(patch)?;

    let mut merged = match local {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }

    Ok(Value::Object(merged))
}

fn as_object(value: &Value) -> CoreResult<&Map<String, Value>> {
    value.as_object().ok_or_else(|| CoreError::InvalidPatch {
        kind: json_kind(value).to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Delta Accumulation
// =============================================================================

/// Adds every numeric leaf of `delta` onto `local`.
///
/// ## Rules
/// - number + number: summed (i64 when both are integers, f64 otherwise)
/// - missing/null local + number: the delta becomes the value
/// - object + object: recurse
/// - any other incoming leaf: overwrites
/// - non-numeric local + number: `MergeFailed`
pub fn accumulate(local: &Value, delta: &Value, event_type: &str) -> CoreResult<Value> {
    let delta = as_object(delta)?;

    let mut merged = match local {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for (key, incoming) in delta {
        let current = merged.get(key).cloned().unwrap_or(Value::Null);
        let next = accumulate_leaf(key, &current, incoming, event_type)?;
        merged.insert(key.clone(), next);
    }

    Ok(Value::Object(merged))
}

fn accumulate_leaf(key: &str, current: &Value, incoming: &Value, event_type: &str) -> CoreResult<Value> {
    match (current, incoming) {
        (Value::Null, Value::Number(_)) => Ok(incoming.clone()),
        (Value::Number(a), Value::Number(b)) => add_numbers(key, a, b, event_type),
        (_, Value::Number(_)) => Err(CoreError::merge_failed(
            event_type,
            format!("field '{}' is {} and cannot take a delta", key, json_kind(current)),
        )),
        (Value::Object(_), Value::Object(_)) | (Value::Null, Value::Object(_)) => {
            accumulate(current, incoming, event_type)
        }
        _ => Ok(incoming.clone()),
    }
}

fn add_numbers(key: &str, a: &Number, b: &Number, event_type: &str) -> CoreResult<Value> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| CoreError::merge_failed(event_type, format!("field '{}' overflowed", key)));
    }

    let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| CoreError::merge_failed(event_type, format!("field '{}' is not finite", key)))
}

// =============================================================================
// Built-in Strategies
// =============================================================================

/// The closed set of built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuiltinStrategy {
    /// Return incoming verbatim.
    FullReplace,

    /// Shallow-merge incoming over local.
    ShallowPatch,

    /// Add numeric fields of incoming onto local.
    DeltaAccumulate,

    /// Full replace for replacement tags, shallow patch otherwise.
    #[default]
    Default,
}

impl MergeStrategy for BuiltinStrategy {
    fn merge(&self, local: &Value, incoming: &Value, event_type: &str) -> CoreResult<Value> {
        match self {
            BuiltinStrategy::FullReplace => Ok(incoming.clone()),
            BuiltinStrategy::ShallowPatch => shallow_merge(local, incoming),
            BuiltinStrategy::DeltaAccumulate => accumulate(local, incoming, event_type),
            BuiltinStrategy::Default => {
                if is_full_replacement(event_type) {
                    Ok(incoming.clone())
                } else {
                    shallow_merge(local, incoming)
                }
            }
        }
    }

    fn is_cumulative(&self, _event_type: &str) -> bool {
        matches!(self, BuiltinStrategy::DeltaAccumulate)
    }
}

impl std::fmt::Display for BuiltinStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuiltinStrategy::FullReplace => write!(f, "full_replace"),
            BuiltinStrategy::ShallowPatch => write!(f, "shallow_patch"),
            BuiltinStrategy::DeltaAccumulate => write!(f, "delta_accumulate"),
            BuiltinStrategy::Default => write!(f, "default"),
        }
    }
}

impl std::str::FromStr for BuiltinStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full_replace" | "replace" => Ok(BuiltinStrategy::FullReplace),
            "shallow_patch" | "patch" => Ok(BuiltinStrategy::ShallowPatch),
            "delta_accumulate" | "delta" => Ok(BuiltinStrategy::DeltaAccumulate),
            "default" => Ok(BuiltinStrategy::Default),
            other => Err(CoreError::Validation(crate::ValidationError::InvalidFormat {
                field: "merge strategy".to_string(),
                reason: format!(
                    "unknown strategy '{}'. Valid options: full_replace, shallow_patch, delta_accumulate, default",
                    other
                ),
            })),
        }
    }
}

// =============================================================================
// Type Dispatch
// =============================================================================

/// Routes event-type tags to strategies, falling back to a default.
///
/// This is the extension point for domain stores:
///
/// ```rust
/// use tally_core::merge::{BuiltinStrategy, TypeDispatch};
///
/// let strategy = TypeDispatch::new()
///     .route("stock.delta", BuiltinStrategy::DeltaAccumulate)
///     .route("session.close", BuiltinStrategy::FullReplace);
/// ```
#[derive(Clone)]
pub struct TypeDispatch {
    routes: HashMap<String, Arc<dyn MergeStrategy>>,
    fallback: Arc<dyn MergeStrategy>,
}

impl TypeDispatch {
    /// Empty routing table over `BuiltinStrategy::Default`.
    pub fn new() -> Self {
        TypeDispatch {
            routes: HashMap::new(),
            fallback: Arc::new(BuiltinStrategy::Default),
        }
    }

    /// Routes `event_type` to `strategy`.
    pub fn route(mut self, event_type: impl Into<String>, strategy: impl MergeStrategy + 'static) -> Self {
        self.routes.insert(event_type.into(), Arc::new(strategy));
        self
    }

    /// Replaces the fallback strategy.
    pub fn fallback(mut self, strategy: impl MergeStrategy + 'static) -> Self {
        self.fallback = Arc::new(strategy);
        self
    }

    fn resolve(&self, event_type: &str) -> &dyn MergeStrategy {
        self.routes
            .get(event_type)
            .map(|s| s.as_ref())
            .unwrap_or_else(|| self.fallback.as_ref())
    }
}

impl Default for TypeDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&String> = self.routes.keys().collect();
        tags.sort();
        f.debug_struct("TypeDispatch").field("routes", &tags).finish()
    }
}

impl MergeStrategy for TypeDispatch {
    fn merge(&self, local: &Value, incoming: &Value, event_type: &str) -> CoreResult<Value> {
        self.resolve(event_type).merge(local, incoming, event_type)
    }

    fn is_cumulative(&self, event_type: &str) -> bool {
        self.resolve(event_type).is_cumulative(event_type)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
