//! # Synced Store
//!
//! One logical aggregate, kept consistent across tabs and devices.
//!
//! ## Write and Apply Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncedStore                                    │
//! │                                                                         │
//! │  LOCAL WRITE (set_state / apply_delta)                                 │
//! │  ─────────────────────────────────────                                  │
//! │   merge into state ─► persist slot ─► queue outbound ─► notify         │
//! │                                          │                              │
//! │                    debounce window ──────┤ same type/kind: coalesce    │
//! │                                          ▼                              │
//! │                          version + 1 ─► bus publish ─► log append      │
//! │                                         (same device)   (background)   │
//! │                                                                         │
//! │  COMMIT (awaited)                                                       │
//! │  ────────────────                                                       │
//! │   merge ─► version + 1 ─► log append ─┬─ ok:  bus publish              │
//! │                                       └─ err: roll back, return Err    │
//! │                                          (conflict: resync first)      │
//! │                                                                         │
//! │  INBOUND (bus, push feed, resync)                                       │
//! │  ────────────────────────────────                                       │
//! │   destroyed? ─► other entity? ─► own origin? ─► version <= local?      │
//! │        │              │               │                │               │
//! │        ▼              ▼               ▼                ▼               │
//! │      drop           drop            drop             drop              │
//! │                                                                         │
//! │   otherwise: guard on ─► merge ─► state + watermark ─► persist         │
//! │              ─► notify ─► guard off                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//! State sits behind a short-lived `std::sync::Mutex`; no lock is held across
//! an `.await`. Inbound applications and outbound version stamps are
//! serialized by a mutation lock, whichever task they run on. While an inbound event is applied, local writes made from
//! that same thread (listeners, strategies) are dropped, so the apply path
//! can never re-broadcast what it is applying. Listeners must not call
//! `apply_inbound` themselves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tally_core::merge::shallow_merge;
use tally_core::validation::{validate_channel, validate_entity_id, validate_event_type};
use tally_core::{
    CoreError, EntityKey, MergeStrategy, Origin, ScopeTags, SyncEvent, SyncState, EVENT_STATE_PATCH,
};

use crate::broadcast::{BroadcastBus, BroadcastEnvelope};
use crate::context::SyncContext;
use crate::emitter::SyncEventEmitter;
use crate::error::{SyncError, SyncResult};
use crate::log::EventLog;
use crate::resync::{resync, ResyncRegistry};
use crate::slot::PersistedSlot;

// =============================================================================
// Configuration
// =============================================================================

/// Identity and outbound behavior of one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub channel: String,
    pub entity_id: String,

    /// Stamped on every outbound event.
    pub scope: ScopeTags,

    /// Outbound coalescing window. `None` sends every write immediately.
    pub debounce: Option<Duration>,
}

impl StoreConfig {
    pub fn new(channel: impl Into<String>, entity_id: impl Into<String>) -> Self {
        StoreConfig {
            channel: channel.into(),
            entity_id: entity_id.into(),
            scope: ScopeTags::default(),
            debounce: None,
        }
    }

    pub fn with_scope(mut self, scope: ScopeTags) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.channel.clone(), self.entity_id.clone())
    }

    pub fn validate(&self) -> SyncResult<()> {
        validate_channel(&self.channel)?;
        validate_entity_id(&self.entity_id)?;
        Ok(())
    }
}

/// Snapshot types a store can hold.
pub trait StoreData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StoreData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// What `apply_inbound` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Merged; the watermark is now the event's version.
    Applied,
    /// Version at or below the watermark.
    Stale,
    /// Authored by this store's own origin.
    SelfAuthored,
    /// Addressed to another entity.
    OtherEntity,
    /// Called from inside another inbound application.
    Reentrant,
    /// The store was destroyed.
    Destroyed,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

// =============================================================================
// Internals
// =============================================================================

type Listener<T> = Arc<dyn Fn(&SyncState<T>) + Send + Sync>;

/// How a local write combines with the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    /// Shallow patch (`set_state`).
    Patch,
    /// Strategy merge (`apply_delta`).
    Delta,
}

/// Outbound payload accumulated during the debounce window.
#[derive(Debug)]
struct PendingOutbound {
    event_type: String,
    kind: WriteKind,
    payload: Value,
}

#[derive(Default)]
struct Outbound {
    pending: Option<PendingOutbound>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    key: EntityKey,
    scope: ScopeTags,
    debounce: Option<Duration>,
    origin: Origin,
    strategy: Arc<dyn MergeStrategy>,
    slot: PersistedSlot,
    bus: BroadcastBus,
    log: Arc<dyn EventLog>,
    emitter: Arc<dyn SyncEventEmitter>,
    registry: ResyncRegistry,
    runtime: Handle,

    state: Mutex<SyncState<T>>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,

    mutation: Mutex<()>,
    applying: AtomicBool,
    applier: Mutex<Option<ThreadId>>,

    outbound: Mutex<Outbound>,
    bus_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.bus_task).take() {
            task.abort();
        }
        if let Some(timer) = lock(&self.outbound).timer.take() {
            timer.abort();
        }
    }
}

/// Locks a mutex, recovering the data if a listener panicked while holding it.
fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn snapshot_mismatch(err: serde_json::Error) -> SyncError {
    SyncError::Core(CoreError::SnapshotMismatch(err.to_string()))
}

/// Marks an inbound application in progress for the current thread.
struct ApplyingGuard<'a> {
    flag: &'a AtomicBool,
    applier: &'a Mutex<Option<ThreadId>>,
}

impl<'a> ApplyingGuard<'a> {
    fn enter<T>(inner: &'a Inner<T>) -> Self {
        *lock(&inner.applier) = Some(thread::current().id());
        inner.applying.store(true, Ordering::SeqCst);
        ApplyingGuard {
            flag: &inner.applying,
            applier: &inner.applier,
        }
    }
}

impl Drop for ApplyingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        *lock(self.applier) = None;
    }
}

// =============================================================================
// Store
// =============================================================================

/// Handle to one synchronized aggregate. Clones share the same store.
pub struct SyncedStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncedStore<T> {
    fn clone(&self) -> Self {
        SyncedStore {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for SyncedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedStore")
            .field("key", &self.inner.key)
            .field("origin", &self.inner.origin)
            .field("destroyed", &self.inner.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: StoreData> SyncedStore<T> {
    /// Opens a store, rehydrating from its persisted slot and joining the
    /// broadcast bus.
    ///
    /// Must be called inside a tokio runtime; background work (bus listener,
    /// debounce timer, outbound appends) is spawned on it.
    pub fn open(
        ctx: &SyncContext,
        config: StoreConfig,
        initial: T,
        strategy: Arc<dyn MergeStrategy>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;

        let key = config.key();
        let slot = PersistedSlot::new(ctx.slots.clone(), &key);
        let persisted = slot.load()?;

        let mut state = SyncState::new(initial);
        state.is_online = ctx.connectivity.is_online();
        if let Some(data) = persisted.data {
            match serde_json::from_value::<T>(data) {
                Ok(data) => {
                    state.data = data;
                    state.version = persisted.version;
                    state.last_sync = persisted.last_sync;
                }
                Err(e) => {
                    warn!(entity = %key, error = %e, "Persisted snapshot does not fit, starting fresh");
                }
            }
        }

        let version = state.version;
        let inner = Arc::new(Inner {
            key,
            scope: config.scope,
            debounce: config.debounce,
            origin: ctx.origin.clone(),
            strategy,
            slot,
            bus: ctx.bus.clone(),
            log: ctx.log.clone(),
            emitter: ctx.emitter.clone(),
            registry: ctx.registry.clone(),
            runtime,
            state: Mutex::new(state),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            mutation: Mutex::new(()),
            applying: AtomicBool::new(false),
            applier: Mutex::new(None),
            outbound: Mutex::new(Outbound::default()),
            bus_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let rx = ctx.bus.subscribe();
        let task = inner.runtime.spawn(bus_loop(Arc::downgrade(&inner), rx));
        *lock(&inner.bus_task) = Some(task);

        info!(entity = %inner.key, origin = %inner.origin, version, "Store opened");
        Ok(SyncedStore { inner })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn state(&self) -> SyncState<T> {
        lock(&self.inner.state).clone()
    }

    pub fn data(&self) -> T {
        lock(&self.inner.state).data.clone()
    }

    /// The watermark.
    pub fn version(&self) -> i64 {
        lock(&self.inner.state).version
    }

    pub fn key(&self) -> &EntityKey {
        &self.inner.key
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn log(&self) -> Arc<dyn EventLog> {
        self.inner.log.clone()
    }

    pub fn emitter(&self) -> Arc<dyn SyncEventEmitter> {
        self.inner.emitter.clone()
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// True while an inbound event is being applied.
    pub fn is_applying(&self) -> bool {
        self.inner.applying.load(Ordering::SeqCst)
    }

    /// A handle that does not keep the store alive.
    pub fn downgrade(&self) -> WeakStore<T> {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Registers a listener and calls it once with the current state.
    pub fn subscribe<F>(&self, listener: F) -> Subscription<T>
    where
        F: Fn(&SyncState<T>) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);

        let current = self.state();
        listener(&current);

        if !self.is_destroyed() {
            lock(&self.inner.listeners).push((id, listener));
        }
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn notify(&self, snapshot: &SyncState<T>) {
        let listeners: Vec<Listener<T>> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    // =========================================================================
    // Local Writes
    // =========================================================================

    /// Shallow-merges `patch` into the state as a `state.patch` event.
    pub fn set_state(&self, patch: Value) -> SyncResult<()> {
        self.write_local(patch, EVENT_STATE_PATCH, WriteKind::Patch)
    }

    /// Shallow-merges `patch` into the state, tagging the outbound event.
    pub fn set_state_with_type(&self, patch: Value, event_type: &str) -> SyncResult<()> {
        self.write_local(patch, event_type, WriteKind::Patch)
    }

    /// Merges `delta` with the store's strategy. Pending deltas of the same
    /// type are combined with that strategy too.
    pub fn apply_delta(&self, delta: Value, event_type: &str) -> SyncResult<()> {
        self.write_local(delta, event_type, WriteKind::Delta)
    }

    fn write_local(&self, payload: Value, event_type: &str, kind: WriteKind) -> SyncResult<()> {
        self.ensure_alive()?;
        if self.is_reentrant() {
            trace!(entity = %self.inner.key, event_type, "Local write dropped during inbound apply");
            return Ok(());
        }
        validate_event_type(event_type)?;

        let snapshot = {
            let _serial = lock(&self.inner.mutation);

            let current = serde_json::to_value(&lock(&self.inner.state).data)?;
            let merged = match kind {
                WriteKind::Patch => shallow_merge(&current, &payload)?,
                WriteKind::Delta => self.inner.strategy.merge(&current, &payload, event_type)?,
            };
            let data: T = serde_json::from_value(merged.clone()).map_err(snapshot_mismatch)?;

            let snapshot = {
                let mut state = lock(&self.inner.state);
                state.data = data;
                state.clone()
            };
            self.persist(&merged, &snapshot);
            self.queue_outbound(PendingOutbound {
                event_type: event_type.to_string(),
                kind,
                payload,
            });
            snapshot
        };

        self.notify(&snapshot);
        Ok(())
    }

    /// Merges `patch` with the strategy, appends it to the event log and
    /// waits for the result.
    ///
    /// Pending debounced writes are flushed first. On success the event is
    /// published to the bus and the new version returned. On failure the
    /// local change is rolled back (unless state has moved on since) and the
    /// log error is returned.
    ///
    /// A `VersionConflict` means another origin wrote that version first.
    /// Its event may have been dropped as stale while ours was in flight,
    /// so the store catches up from the log before the error is returned
    /// and a retry claims a fresh version.
    pub async fn commit(&self, patch: Value, event_type: &str) -> SyncResult<i64> {
        self.ensure_alive()?;
        if self.is_reentrant() {
            return Err(SyncError::ApplyInProgress(self.inner.key.to_string()));
        }
        validate_event_type(event_type)?;

        if let Err(e) = self.flush().await {
            warn!(entity = %self.inner.key, error = %e, "Pending write failed before commit");
        }

        let (event, previous, merged, committed) = {
            let _serial = lock(&self.inner.mutation);

            let previous = self.state();
            let current = serde_json::to_value(&previous.data)?;
            let merged = self.inner.strategy.merge(&current, &patch, event_type)?;
            let data: T = serde_json::from_value(merged.clone()).map_err(snapshot_mismatch)?;

            let committed = {
                let mut state = lock(&self.inner.state);
                state.data = data;
                state.version += 1;
                state.clone()
            };
            self.persist(&merged, &committed);

            let event = self.event(event_type, patch, committed.version);
            (event, previous, merged, committed)
        };
        self.notify(&committed);

        match self.inner.log.append(&event).await {
            Ok(()) => {
                if !self.is_destroyed() {
                    self.inner.bus.publish(BroadcastEnvelope::new(&event, merged));
                }
                debug!(entity = %self.inner.key, version = event.version, event_type, "Committed");
                Ok(event.version)
            }
            Err(e) => {
                warn!(entity = %self.inner.key, version = event.version, error = %e, "Commit rejected");
                if !self.is_destroyed() {
                    self.roll_back(previous, event.version);
                    if matches!(e, SyncError::VersionConflict { .. }) {
                        let outcome = resync(self, &self.inner.registry, None).await;
                        debug!(entity = %self.inner.key, ?outcome, "Caught up after version conflict");
                    }
                }
                Err(e)
            }
        }
    }

    fn roll_back(&self, previous: SyncState<T>, failed_version: i64) {
        let restored = {
            let _serial = lock(&self.inner.mutation);
            let restored = {
                let mut state = lock(&self.inner.state);
                if state.version != failed_version {
                    None
                } else {
                    state.data = previous.data;
                    state.version = previous.version;
                    Some(state.clone())
                }
            };
            if let Some(snapshot) = &restored {
                match serde_json::to_value(&snapshot.data) {
                    Ok(value) => self.persist(&value, snapshot),
                    Err(e) => warn!(entity = %self.inner.key, error = %e, "Cannot persist rolled back state"),
                }
            }
            restored
        };

        match restored {
            Some(snapshot) => self.notify(&snapshot),
            None => {
                warn!(entity = %self.inner.key, failed_version, "State moved on during commit, rollback skipped");
            }
        }
    }

    /// Reports connectivity. Listeners see the new flag.
    pub fn set_online(&self, online: bool) {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            if state.is_online == online {
                return;
            }
            state.is_online = online;
            state.clone()
        };
        debug!(entity = %self.inner.key, online, "Connectivity changed");
        self.notify(&snapshot);
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn queue_outbound(&self, write: PendingOutbound) {
        let Some(window) = self.inner.debounce else {
            self.send_now(write);
            return;
        };

        let mut outbound = lock(&self.inner.outbound);
        let next = match outbound.pending.take() {
            Some(pending) if pending.event_type == write.event_type && pending.kind == write.kind => {
                match self.coalesce(&pending, &write.payload) {
                    Ok(payload) => PendingOutbound { payload, ..pending },
                    Err(e) => {
                        warn!(entity = %self.inner.key, error = %e, "Cannot coalesce, sending pending write");
                        self.send_now(pending);
                        write
                    }
                }
            }
            Some(pending) => {
                // Type or kind changed: what is pending goes out first
                self.send_now(pending);
                write
            }
            None => write,
        };
        outbound.pending = Some(next);

        if let Some(timer) = outbound.timer.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        outbound.timer = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                SyncedStore { inner }.fire_timer();
            }
        }));
    }

    fn coalesce(&self, pending: &PendingOutbound, payload: &Value) -> SyncResult<Value> {
        let combined = match pending.kind {
            WriteKind::Patch => shallow_merge(&pending.payload, payload)?,
            WriteKind::Delta => self
                .inner
                .strategy
                .merge(&pending.payload, payload, &pending.event_type)?,
        };
        Ok(combined)
    }

    fn fire_timer(&self) {
        let _serial = lock(&self.inner.mutation);
        let pending = {
            let mut outbound = lock(&self.inner.outbound);
            outbound.timer = None;
            outbound.pending.take()
        };
        if let Some(pending) = pending {
            self.send_now(pending);
        }
    }

    /// Stamps the next version, publishes on the bus and appends in the
    /// background. Callers hold the mutation lock.
    fn send_now(&self, pending: PendingOutbound) {
        let event = match self.stamp(pending) {
            Ok(event) => event,
            Err(e) => {
                warn!(entity = %self.inner.key, error = %e, "Dropping outbound write");
                return;
            }
        };

        let log = self.inner.log.clone();
        let key = self.inner.key.clone();
        self.inner.runtime.spawn(async move {
            if let Err(e) = log.append(&event).await {
                warn!(entity = %key, version = event.version, error = %e, "Outbound append failed, local state kept");
            }
        });
    }

    fn stamp(&self, pending: PendingOutbound) -> SyncResult<SyncEvent> {
        let (data, snapshot) = {
            let mut state = lock(&self.inner.state);
            state.version += 1;
            (serde_json::to_value(&state.data)?, state.clone())
        };
        self.persist(&data, &snapshot);

        let event = self.event(&pending.event_type, pending.payload, snapshot.version);
        let receivers = self.inner.bus.publish(BroadcastEnvelope::new(&event, data));
        trace!(entity = %self.inner.key, version = event.version, receivers, "Outbound event stamped");
        Ok(event)
    }

    /// Sends the pending write now and waits for the log. Returns the
    /// version written, or `None` if nothing was pending.
    pub async fn flush(&self) -> SyncResult<Option<i64>> {
        let event = {
            let _serial = lock(&self.inner.mutation);
            let pending = {
                let mut outbound = lock(&self.inner.outbound);
                if let Some(timer) = outbound.timer.take() {
                    timer.abort();
                }
                outbound.pending.take()
            };
            let Some(pending) = pending else {
                return Ok(None);
            };
            self.stamp(pending)?
        };

        self.inner.log.append(&event).await?;
        Ok(Some(event.version))
    }

    /// True if a debounced write is waiting.
    pub fn has_pending(&self) -> bool {
        lock(&self.inner.outbound).pending.is_some()
    }

    fn event(&self, event_type: &str, payload: Value, version: i64) -> SyncEvent {
        SyncEvent::new(&self.inner.key, event_type, payload, version, self.inner.origin.token())
            .with_scope(self.inner.scope.clone())
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Applies an event from another origin.
    ///
    /// `snapshot` is the sender's full state when known (bus envelopes).
    /// Cumulative event types always merge the payload instead.
    ///
    /// A merge failure is reported to the emitter, returned, and leaves both
    /// state and watermark untouched.
    pub fn apply_inbound(&self, event: &SyncEvent, snapshot: Option<&Value>) -> SyncResult<ApplyOutcome> {
        let inner = &*self.inner;

        if self.is_destroyed() {
            return Ok(ApplyOutcome::Destroyed);
        }
        if !inner.key.matches(&event.channel, &event.entity_id) {
            return Ok(ApplyOutcome::OtherEntity);
        }
        if inner.origin.is_self(&event.origin) {
            trace!(entity = %inner.key, version = event.version, "Dropping own echo");
            return Ok(ApplyOutcome::SelfAuthored);
        }
        if self.is_reentrant() {
            return Ok(ApplyOutcome::Reentrant);
        }

        let _serial = lock(&inner.mutation);
        let local = {
            let state = lock(&inner.state);
            if event.version <= state.version {
                trace!(entity = %inner.key, version = event.version, local = state.version, "Dropping stale event");
                return Ok(ApplyOutcome::Stale);
            }
            serde_json::to_value(&state.data)?
        };

        let _guard = ApplyingGuard::enter(inner);

        let incoming = match snapshot {
            Some(full) if !inner.strategy.is_cumulative(&event.event_type) => full,
            _ => &event.payload,
        };
        let merged = inner
            .strategy
            .merge(&local, incoming, &event.event_type)
            .map_err(SyncError::from)
            .and_then(|merged| {
                let data: T = serde_json::from_value(merged.clone()).map_err(snapshot_mismatch)?;
                Ok((merged, data))
            });
        let (merged, data) = match merged {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    entity = %inner.key,
                    version = event.version,
                    event_type = %event.event_type,
                    error = %e,
                    "Inbound merge failed"
                );
                inner.emitter.emit_error(&inner.key, &e);
                return Err(e);
            }
        };

        let applied = {
            let mut state = lock(&inner.state);
            state.data = data;
            state.version = event.version;
            state.last_sync = Some(Utc::now());
            state.clone()
        };
        self.persist(&merged, &applied);
        debug!(
            entity = %inner.key,
            version = event.version,
            event_type = %event.event_type,
            origin = %event.origin,
            "Applied inbound event"
        );

        self.notify(&applied);
        Ok(ApplyOutcome::Applied)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops the store: the bus listener and the debounce timer are
    /// cancelled, pending outbound writes discarded, listeners dropped.
    /// Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut outbound = lock(&self.inner.outbound);
            if let Some(timer) = outbound.timer.take() {
                timer.abort();
            }
            if outbound.pending.take().is_some() {
                debug!(entity = %self.inner.key, "Discarding pending outbound write");
            }
        }
        if let Some(task) = lock(&self.inner.bus_task).take() {
            task.abort();
        }
        lock(&self.inner.listeners).clear();

        info!(entity = %self.inner.key, "Store destroyed");
    }

    fn ensure_alive(&self) -> SyncResult<()> {
        if self.is_destroyed() {
            return Err(SyncError::StoreDestroyed(self.inner.key.to_string()));
        }
        Ok(())
    }

    fn is_reentrant(&self) -> bool {
        self.inner.applying.load(Ordering::SeqCst)
            && *lock(&self.inner.applier) == Some(thread::current().id())
    }

    fn persist(&self, data: &Value, snapshot: &SyncState<T>) {
        if let Err(e) = self.inner.slot.save(data, snapshot.version, snapshot.last_sync) {
            warn!(entity = %self.inner.key, error = %e, "Persisting slot failed");
            self.inner.emitter.emit_error(&self.inner.key, &e);
        }
    }
}

async fn bus_loop<T: StoreData>(inner: Weak<Inner<T>>, mut rx: broadcast::Receiver<BroadcastEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !envelope.is_for(&inner.key.channel, &inner.key.entity_id) {
                    continue;
                }
                let store = SyncedStore { inner };
                // Failures already went to the emitter
                let _ = store.apply_inbound(&envelope.event(), Some(&envelope.state));
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Broadcast receiver lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Non-owning store handle for background tasks.
pub struct WeakStore<T> {
    inner: Weak<Inner<T>>,
}

impl<T> WeakStore<T> {
    pub fn upgrade(&self) -> Option<SyncedStore<T>> {
        self.inner.upgrade().map(|inner| SyncedStore { inner })
    }
}

impl<T> Clone for WeakStore<T> {
    fn clone(&self) -> Self {
        WeakStore {
            inner: self.inner.clone(),
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle returned by [`SyncedStore::subscribe`].
///
/// The listener stays registered until `unsubscribe` is called or the store
/// is destroyed; dropping the handle does not remove it.
pub struct Subscription<T> {
    id: u64,
    inner: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::NoOpEmitter;
    use crate::log::MemoryEventLog;
    use crate::slot::{MemorySlotStore, SlotStore};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::OnceLock;
    use tally_core::{BuiltinStrategy, TypeDispatch};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        #[serde(default)]
        a: i64,
        #[serde(default)]
        b: i64,
    }

    struct Harness {
        ctx: SyncContext,
        log: Arc<MemoryEventLog>,
        slots: MemorySlotStore,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn harness(tab: &str) -> Harness {
        let log = Arc::new(MemoryEventLog::new());
        let slots = MemorySlotStore::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let ctx = SyncContext::new(Origin::new("dev-1", tab), log.clone(), Arc::new(slots.clone()))
            .with_emitter(Arc::new(move |_: &EntityKey, e: &SyncError| {
                sink.lock().unwrap().push(e.to_string());
            }));
        Harness {
            ctx,
            log,
            slots,
            errors,
        }
    }

    fn counter_store(h: &Harness, debounce: Option<u64>) -> SyncedStore<Counter> {
        let mut config = StoreConfig::new("counter", "c-1");
        if let Some(ms) = debounce {
            config = config.with_debounce(Duration::from_millis(ms));
        }
        SyncedStore::open(&h.ctx, config, Counter::default(), Arc::new(BuiltinStrategy::Default)).unwrap()
    }

    fn remote(version: i64, payload: Value) -> SyncEvent {
        SyncEvent::new(&EntityKey::new("counter", "c-1"), "state.patch", payload, version, "dev-2:tab-9")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_write_is_visible_immediately() {
        let h = harness("tab-a");
        let store = counter_store(&h, Some(1_000));

        store.set_state(json!({ "a": 4 })).unwrap();

        assert_eq!(store.data().a, 4);
        assert_eq!(
            h.slots.get("sync:counter:c-1:state").unwrap().as_deref(),
            Some(r#"{"a":4,"b":0}"#)
        );
        assert!(store.has_pending());
        assert_eq!(h.log.append_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_fires_immediately_and_unsubscribes() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let sub = store.subscribe(move |state: &SyncState<Counter>| sink.lock().unwrap().push(state.data.a));
        store.set_state(json!({ "a": 1 })).unwrap();
        sub.unsubscribe();
        store.set_state(json!({ "a": 2 })).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_is_monotonic() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);

        assert!(store.apply_inbound(&remote(1, json!({ "a": 1 })), None).unwrap().is_applied());
        assert!(store.apply_inbound(&remote(3, json!({ "a": 3 })), None).unwrap().is_applied());
        assert_eq!(
            store.apply_inbound(&remote(2, json!({ "a": 2 })), None).unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(
            store.apply_inbound(&remote(3, json!({ "a": 9 })), None).unwrap(),
            ApplyOutcome::Stale
        );

        assert_eq!(store.version(), 3);
        assert_eq!(store.data().a, 3);
        assert!(store.state().last_sync.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_echo_is_never_applied() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);

        let echo = SyncEvent::new(&EntityKey::new("counter", "c-1"), "state.patch", json!({ "a": 7 }), 5, "dev-1:tab-a");
        assert_eq!(store.apply_inbound(&echo, None).unwrap(), ApplyOutcome::SelfAuthored);
        assert_eq!(store.version(), 0);

        let other = SyncEvent::new(&EntityKey::new("counter", "c-2"), "state.patch", json!({ "a": 7 }), 5, "dev-2:tab");
        assert_eq!(store.apply_inbound(&other, None).unwrap(), ApplyOutcome::OtherEntity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_into_one_event() {
        let h = harness("tab-a");
        let store = counter_store(&h, Some(100));

        for i in 1..=5 {
            store.set_state(json!({ "a": i })).unwrap();
        }
        store.set_state(json!({ "b": 2 })).unwrap();
        assert_eq!(h.log.append_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = h.log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[0].payload, json!({ "a": 5, "b": 2 }));
        assert_eq!(events[0].origin, "dev-1:tab-a");
        assert_eq!(store.version(), 1);
        assert!(!store.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_change_sends_pending_first() {
        let h = harness("tab-a");
        let store = counter_store(&h, Some(100));

        store.set_state_with_type(json!({ "a": 1 }), "counter.one").unwrap();
        store.set_state_with_type(json!({ "b": 1 }), "counter.two").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut events = h.log.events();
        events.sort_by_key(|e| e.version);
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["counter.one", "counter.two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deltas_accumulate_locally_and_in_flight() {
        let h = harness("tab-a");
        let strategy = TypeDispatch::new().route("counter.add", BuiltinStrategy::DeltaAccumulate);
        let store = SyncedStore::open(
            &h.ctx,
            StoreConfig::new("counter", "c-1").with_debounce(Duration::from_millis(50)),
            Counter::default(),
            Arc::new(strategy),
        )
        .unwrap();

        for _ in 0..3 {
            store.apply_delta(json!({ "a": 2 }), "counter.add").unwrap();
        }
        assert_eq!(store.data().a, 6);

        assert_eq!(store.flush().await.unwrap(), Some(1));
        assert_eq!(h.log.events()[0].payload, json!({ "a": 6 }));
        assert_eq!(store.flush().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_device_convergence_without_log() {
        let bus = BroadcastBus::default();
        let a = harness("tab-a");
        let b = harness("tab-b");
        a.log.fail_appends(true);

        let tab_a = SyncedStore::open(
            &a.ctx.clone().with_bus(bus.clone()),
            StoreConfig::new("counter", "c-1"),
            Counter { a: 1, b: 0 },
            Arc::new(BuiltinStrategy::Default),
        )
        .unwrap();
        let tab_b = SyncedStore::open(
            &b.ctx.clone().with_bus(bus.clone()),
            StoreConfig::new("counter", "c-1"),
            Counter { a: 1, b: 0 },
            Arc::new(BuiltinStrategy::Default),
        )
        .unwrap();

        tab_a.set_state(json!({ "a": 2 })).unwrap();
        settle().await;

        assert_eq!(tab_b.data(), Counter { a: 2, b: 0 });
        assert_eq!(tab_b.version(), 1);
        assert_eq!(tab_a.version(), 1);
        assert_eq!(a.log.append_count(), 0);
    }

    /// Calls back into its own store from inside `merge`.
    struct Meddler {
        store: OnceLock<SyncedStore<Value>>,
        attempts: Mutex<Vec<(bool, bool)>>,
    }

    impl MergeStrategy for Meddler {
        fn merge(&self, local: &Value, incoming: &Value, event_type: &str) -> tally_core::CoreResult<Value> {
            if let Some(store) = self.store.get() {
                let accepted = store.set_state(json!({ "hijack": true })).is_ok();
                self.attempts.lock().unwrap().push((accepted, store.is_applying()));
            }
            BuiltinStrategy::ShallowPatch.merge(local, incoming, event_type)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_write_during_apply_is_dropped() {
        let h = harness("tab-a");
        let meddler = Arc::new(Meddler {
            store: OnceLock::new(),
            attempts: Mutex::new(Vec::new()),
        });
        let store = SyncedStore::open(&h.ctx, StoreConfig::new("counter", "c-1"), json!({}), meddler.clone()).unwrap();
        let _ = meddler.store.set(store.clone());
        let mut bus_rx = h.ctx.bus.subscribe();

        assert!(store.apply_inbound(&remote(1, json!({ "a": 1 })), None).unwrap().is_applied());
        settle().await;

        assert_eq!(*meddler.attempts.lock().unwrap(), vec![(true, true)]);
        assert_eq!(store.data(), json!({ "a": 1 }));
        assert_eq!(store.version(), 1);
        assert!(!store.is_applying());
        assert_eq!(h.log.append_count(), 0);
        assert!(bus_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_failure_keeps_state_and_reports() {
        let h = harness("tab-a");
        let strategy = TypeDispatch::new().route("counter.add", BuiltinStrategy::DeltaAccumulate);
        let store = SyncedStore::open(&h.ctx, StoreConfig::new("counter", "c-1"), json!({ "a": "text" }), Arc::new(strategy)).unwrap();

        let mut bad = remote(1, json!({ "a": 1 }));
        bad.event_type = "counter.add".into();

        let err = store.apply_inbound(&bad, None).unwrap_err();
        assert!(err.is_merge_error());
        assert_eq!(store.version(), 0);
        assert_eq!(store.data(), json!({ "a": "text" }));
        assert_eq!(h.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_wins_over_payload_for_non_cumulative_types() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);
        store.set_state(json!({ "b": 5 })).unwrap();

        let snapshot = json!({ "a": 3, "b": 1 });
        store.apply_inbound(&remote(4, json!({ "a": 3 })), Some(&snapshot)).unwrap();

        assert_eq!(store.data(), Counter { a: 3, b: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rehydrates_from_slot() {
        let h = harness("tab-a");
        h.slots.set("sync:counter:c-1:state", r#"{"a":9,"b":1}"#).unwrap();
        h.slots.set("sync:counter:c-1:version", "5").unwrap();

        let store = counter_store(&h, None);
        assert_eq!(store.data(), Counter { a: 9, b: 1 });
        assert_eq!(store.version(), 5);
        assert_eq!(
            store.apply_inbound(&remote(5, json!({ "a": 0 })), None).unwrap(),
            ApplyOutcome::Stale
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_appends_and_publishes() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);
        let mut bus_rx = h.ctx.bus.subscribe();

        assert_eq!(store.commit(json!({ "a": 3 }), "state.patch").await.unwrap(), 1);

        assert_eq!(h.log.append_count(), 1);
        let envelope = bus_rx.recv().await.unwrap();
        assert_eq!(envelope.version, 1);
        assert_eq!(envelope.state, json!({ "a": 3, "b": 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_rolls_back() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);
        store.apply_inbound(&remote(2, json!({ "a": 1 })), None).unwrap();
        h.log.fail_appends(true);

        let err = store.commit(json!({ "a": 50 }), "state.patch").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.data().a, 1);
        assert_eq!(store.version(), 2);
        assert_eq!(h.slots.get("sync:counter:c-1:version").unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_discards_pending_and_rejects_writes() {
        let h = harness("tab-a");
        let store = counter_store(&h, Some(100));
        store.set_state(json!({ "a": 1 })).unwrap();

        store.destroy();
        store.destroy();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.log.append_count(), 0);
        assert!(matches!(store.set_state(json!({ "a": 2 })), Err(SyncError::StoreDestroyed(_))));
        assert_eq!(store.apply_inbound(&remote(1, json!({ "a": 5 })), None).unwrap(), ApplyOutcome::Destroyed);
        assert_eq!(h.ctx.bus.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_online_notifies() {
        let h = harness("tab-a");
        let store = counter_store(&h, None);
        let flags = Arc::new(Mutex::new(Vec::new()));
        let sink = flags.clone();
        let _sub = store.subscribe(move |state: &SyncState<Counter>| sink.lock().unwrap().push(state.is_online));

        store.set_online(false);
        store.set_online(false);
        store.set_online(true);

        assert_eq!(*flags.lock().unwrap(), vec![true, false, true]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timer_stamps_and_inbound_applies_never_share_a_version() {
        let h = harness("tab-a");
        let store = counter_store(&h, Some(1));

        let inbound = store.clone();
        let applier = tokio::task::spawn_blocking(move || {
            let mut applied = Vec::new();
            for _ in 0..200 {
                let next = inbound.version() + 1;
                if let Ok(ApplyOutcome::Applied) = inbound.apply_inbound(&remote(next, json!({ "b": next })), None) {
                    applied.push(next);
                }
            }
            applied
        });

        for i in 0..200 {
            store.set_state(json!({ "a": i })).unwrap();
            tokio::time::sleep(Duration::from_micros(300)).await;
        }
        let applied = applier.await.unwrap();
        store.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        for event in h.log.events() {
            assert!(!applied.contains(&event.version), "local v{} reused an inbound version", event.version);
        }

        let persisted = PersistedSlot::new(Arc::new(h.slots.clone()), store.key()).load().unwrap();
        assert_eq!(persisted.version, store.version());
        assert_eq!(persisted.data, Some(serde_json::to_value(store.data()).unwrap()));
    }

    #[test]
    fn test_open_outside_runtime_fails() {
        let h = harness("tab-a");
        let ctx = h.ctx.with_emitter(Arc::new(NoOpEmitter));
        let err = SyncedStore::open(&ctx, StoreConfig::new("counter", "c-1"), Counter::default(), Arc::new(BuiltinStrategy::Default))
            .unwrap_err();
        assert!(matches!(err, SyncError::NoRuntime(_)));
    }
}
