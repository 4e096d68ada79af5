//! # Error Emitter
//!
//! The `on_error` callback of a store. Inbound apply failures, push
//! subscription failures and resync query failures are reported here instead
//! of being returned to a caller that is not waiting for them.

use tally_core::EntityKey;
use tracing::error;

use crate::error::SyncError;

/// Receives errors that have no awaiting caller.
pub trait SyncEventEmitter: Send + Sync {
    fn emit_error(&self, key: &EntityKey, error: &SyncError);
}

/// Logs every error with `tracing`. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl SyncEventEmitter for TracingEmitter {
    fn emit_error(&self, key: &EntityKey, err: &SyncError) {
        error!(entity = %key, error = %err, retryable = err.is_retryable(), "Sync error");
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_error(&self, _key: &EntityKey, _error: &SyncError) {}
}

impl<F> SyncEventEmitter for F
where
    F: Fn(&EntityKey, &SyncError) + Send + Sync,
{
    fn emit_error(&self, key: &EntityKey, error: &SyncError) {
        self(key, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_emitter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let emitter: Arc<dyn SyncEventEmitter> = Arc::new(move |key: &EntityKey, err: &SyncError| {
            sink.lock().unwrap().push(format!("{}: {}", key, err));
        });

        emitter.emit_error(
            &EntityKey::new("loyalty", "cust-1"),
            &SyncError::LogUnavailable("offline".into()),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("loyalty/cust-1"));
    }
}
