//! The public engine surface.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheBinding, CacheBridge, CacheRead, CacheSideEffect, NoopCache, ServerCache, StaleOptimistic,
};
use crate::config::EngineConfig;
use crate::diagnostics::{
    Diagnostic, DiagnosticsConfig, DiagnosticsHandle, DiagnosticsId, DiagnosticsManager,
    ResyncReason,
};
use crate::error::{Result, SyncError};
use crate::history::{HistorySnapshot, HistoryTracker};
use crate::persistence::{PersistenceAdapter, PersistenceBackend};
use crate::pipeline::{Outcome, Pipeline, StageContext, Validator};
use crate::state::StateStore;
use crate::stream::{EnvelopeDecoder, EnvelopeOutcome, ResyncHandler, StreamApplier};
use crate::subscriptions::{Conflict, NamespaceView, SubscriptionHandle};
use crate::types::{
    Clock, CorrelationId, EventEnvelope, MutationDescriptor, NamespacePattern, Origin, Patch,
    SystemClock, Timestamp,
};

/// What happened to an inbound envelope.
#[derive(Debug)]
pub enum EnvelopeReceipt {
    /// The envelope and any successors it unblocked went through the pipeline.
    Applied(Vec<Outcome>),
    /// Held behind a gap.
    Buffered,
    /// Already applied; discarded.
    Duplicate,
    /// Held behind a gap that outgrew its bounds; a resync was requested.
    ResyncRequested,
    /// Outside the configured namespace filter.
    Filtered,
}

/// How to settle a manual reconciliation conflict.
#[derive(Clone, Debug, PartialEq)]
pub enum ConflictResolution {
    KeepLocal,
    TakeRemote,
    Use(Value),
}

/// Collects descriptors to submit as one tick.
#[derive(Default)]
pub struct Batch {
    descriptors: Vec<MutationDescriptor>,
    now: Timestamp,
}

impl Batch {
    /// Queue a local patch.
    pub fn set(&mut self, namespace: &str, patch: Patch) -> &mut Self {
        self.descriptors
            .push(MutationDescriptor::local(namespace, patch, self.now));
        self
    }

    /// Queue an already built descriptor.
    pub fn push(&mut self, descriptor: MutationDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Resets the tick flag even if a stage panics.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A batch's place in line: run by this caller, or left in the queue for
/// the caller that owns the running tick.
enum Admission<'a> {
    Run(Vec<MutationDescriptor>, TickGuard<'a>),
    Queued(usize),
}

/// Builder for [`Engine`] collaborators.
///
/// ```ignore
/// let engine = Engine::builder(config)
///     .backend(Arc::new(FileBackend::open("state")?))
///     .server_cache(cache)
///     .resync_handler(transport)
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    backends: Vec<Arc<dyn PersistenceBackend>>,
    server_cache: Arc<dyn ServerCache>,
    resync: Option<Arc<dyn ResyncHandler>>,
    decoder: Option<Arc<dyn EnvelopeDecoder>>,
    clock: Arc<dyn Clock>,
    validators: Vec<(NamespacePattern, Box<dyn Validator>)>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            server_cache: Arc::new(NoopCache),
            resync: None,
            decoder: None,
            clock: Arc::new(SystemClock),
            validators: Vec::new(),
        }
    }

    /// Append a persistence backend. Backends are tried in the order added.
    pub fn backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn server_cache(mut self, cache: Arc<dyn ServerCache>) -> Self {
        self.server_cache = cache;
        self
    }

    pub fn resync_handler(mut self, handler: Arc<dyn ResyncHandler>) -> Self {
        self.resync = Some(handler);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn EnvelopeDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate values of namespaces matching `pattern` before commit.
    pub fn validator(mut self, pattern: &str, validator: impl Validator + 'static) -> Self {
        self.validators
            .push((NamespacePattern::from(pattern), Box::new(validator)));
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let config = self.config;

        let diagnostics = DiagnosticsManager::with_default_buffer(config.diagnostics_buffer);
        let mut pipeline = Pipeline::new(
            PersistenceAdapter::new(config.persistence(), self.backends),
            CacheBridge::new(config.cache_bindings.clone(), config.conflict_policy),
            HistoryTracker::new(config.history_limit),
        );
        for (pattern, validator) in self.validators {
            pipeline.inbound_mut().add_validator(pattern, validator);
        }

        let stream = match self.decoder {
            Some(decoder) => StreamApplier::with_decoder(config.stream(), decoder),
            None => StreamApplier::new(config.stream()),
        };

        let store = StateStore::new();
        if config.rehydrate {
            if let Some(snapshot) = pipeline.persistence_mut().adapter_mut().load(&diagnostics) {
                info!(
                    target: "syncstore::engine",
                    namespaces = snapshot.namespaces.len(), "Rehydrated from snapshot"
                );
                for (namespace, value) in snapshot.namespaces {
                    store.mount(&namespace, value);
                }
            }
        }

        Ok(Engine {
            config,
            store,
            pipeline: Mutex::new(pipeline),
            stream: Mutex::new(stream),
            queue: Mutex::new(VecDeque::new()),
            in_tick: AtomicBool::new(false),
            diagnostics,
            server_cache: self.server_cache,
            resync: self.resync,
            clock: self.clock,
        })
    }
}

/// A reactive state container kept consistent with an event stream, a
/// server cache and durable storage.
///
/// Every change, from any source, goes through the mutation pipeline. Calls
/// made while a tick is running (from a subscriber callback, or another
/// thread) are queued and applied before the running tick's caller returns.
pub struct Engine {
    config: EngineConfig,
    store: StateStore,
    pipeline: Mutex<Pipeline>,
    stream: Mutex<StreamApplier>,
    /// Batches submitted while a tick was running.
    queue: Mutex<VecDeque<Vec<MutationDescriptor>>>,
    in_tick: AtomicBool,
    diagnostics: DiagnosticsManager,
    server_cache: Arc<dyn ServerCache>,
    resync: Option<Arc<dyn ResyncHandler>>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Create an engine with no backends and no external collaborators.
    pub fn create(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // --- Store ---

    pub fn get_state(&self, namespace: &str) -> Option<Arc<Value>> {
        self.store.get(namespace)
    }

    pub fn view(&self, namespace: &str) -> Option<NamespaceView> {
        self.store.view(namespace)
    }

    /// The conflict marker on a namespace, if any.
    pub fn conflict(&self, namespace: &str) -> Option<Arc<Conflict>> {
        self.store.view(namespace).and_then(|v| v.conflict)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.store.namespaces()
    }

    /// Apply a local patch.
    ///
    /// Returns [`SyncError::MalformedMutation`] if the patch does not fit the
    /// current value or fails validation; the state is left untouched.
    pub fn set_state(&self, namespace: &str, patch: Patch) -> Result<Outcome> {
        self.apply(MutationDescriptor::local(namespace, patch, self.now()))
    }

    /// Submit a single descriptor of any origin.
    pub fn apply(&self, descriptor: MutationDescriptor) -> Result<Outcome> {
        let outcome = self
            .submit(vec![descriptor])
            .into_iter()
            .next()
            .unwrap_or(Outcome::Deferred);
        match outcome {
            Outcome::Rejected { error, .. } => Err(error),
            other => Ok(other),
        }
    }

    /// Submit several descriptors as one tick.
    pub fn batch<F>(&self, build: F) -> Vec<Outcome>
    where
        F: FnOnce(&mut Batch),
    {
        let mut batch = Batch {
            descriptors: Vec::new(),
            now: self.now(),
        };
        build(&mut batch);
        self.submit(batch.descriptors)
    }

    /// Observe a derived value of one namespace. The callback runs after a
    /// commit only if the selector's output changed.
    pub fn subscribe<S, Sel, Cb>(&self, namespace: &str, selector: Sel, callback: Cb) -> SubscriptionHandle
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&NamespaceView) -> S + Send + 'static,
        Cb: FnMut(&S) + Send + 'static,
    {
        let id = self.store.subscribe(namespace, selector, callback);
        SubscriptionHandle {
            id,
            namespace: namespace.to_string(),
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.store.unsubscribe(handle.id)
    }

    /// Add a namespace with an initial value. Returns false if it existed.
    pub fn mount(&self, namespace: &str, initial: Value) -> bool {
        self.store.mount(namespace, initial)
    }

    /// Remove a namespace, its subscribers, its stream watermark and any
    /// pending optimistic update.
    pub fn unmount(&self, namespace: &str) -> bool {
        self.stream.lock().forget(namespace);
        self.pipeline.lock().bridge_mut().clear_pending(namespace);
        self.store.unmount(namespace).is_some()
    }

    // --- Driver ---

    fn submit(&self, batch: Vec<MutationDescriptor>) -> Vec<Outcome> {
        let admission = self.admit(batch);
        self.drive(admission)
    }

    /// Claim the tick for `batch` or queue it behind the running one.
    ///
    /// Once admitted a batch cannot be overtaken by later admissions, so a
    /// caller that must keep an order across threads admits while holding
    /// the lock that defines that order.
    fn admit(&self, batch: Vec<MutationDescriptor>) -> Admission<'_> {
        if batch.is_empty() {
            return Admission::Queued(0);
        }

        if self.in_tick.swap(true, Ordering::AcqRel) {
            let count = batch.len();
            debug!(
                target: "syncstore::engine",
                count, "Tick in progress, deferring batch"
            );
            self.queue.lock().push_back(batch);
            return Admission::Queued(count);
        }
        Admission::Run(batch, TickGuard(&self.in_tick))
    }

    fn drive(&self, admission: Admission<'_>) -> Vec<Outcome> {
        let outcomes = match admission {
            Admission::Run(batch, guard) => {
                let outcomes = self.run_batch(batch);
                self.drain_queue();
                drop(guard);
                outcomes
            }
            Admission::Queued(count) => std::iter::repeat_with(|| Outcome::Deferred).take(count).collect(),
        };

        // Batches queued between the last drain and the flag reset
        while !self.queue.lock().is_empty() && !self.in_tick.swap(true, Ordering::AcqRel) {
            let _guard = TickGuard(&self.in_tick);
            self.drain_queue();
        }
        outcomes
    }

    fn drain_queue(&self) {
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(batch) => {
                    self.run_batch(batch);
                }
                None => break,
            }
        }
    }

    fn run_batch(&self, batch: Vec<MutationDescriptor>) -> Vec<Outcome> {
        let report = {
            let mut pipeline = self.pipeline.lock();
            let ctx = StageContext {
                store: &self.store,
                diagnostics: &self.diagnostics,
                now: self.now(),
            };
            pipeline.run_tick(batch, &ctx)
        };

        // Pipeline released: collaborators may call back in
        for effect in &report.cache_effects {
            match effect {
                CacheSideEffect::Invalidate { cache_key } => self.server_cache.invalidate(cache_key),
                CacheSideEffect::Write { cache_key, value } => {
                    self.server_cache.write(cache_key, value)
                }
            }
        }
        for (namespace, view) in &report.notifications {
            self.store.notify(namespace, view);
        }
        report.outcomes
    }

    // --- Event stream ---

    /// Feed one envelope from the event stream.
    pub fn on_envelope(&self, envelope: EventEnvelope) -> EnvelopeReceipt {
        let namespace = envelope.namespace.clone();
        let received = envelope.sequence_number;
        let now = self.now();

        let mut stream = self.stream.lock();
        let outcome = stream.on_envelope(envelope, now);
        match outcome {
            EnvelopeOutcome::Applied {
                mutations,
                rejected,
            } => {
                // Admitted under the stream lock so later sequences queue behind
                let admission = self.admit(mutations);
                drop(stream);
                self.report_undecodable(&namespace, rejected);
                EnvelopeReceipt::Applied(self.drive(admission))
            }
            EnvelopeOutcome::Buffered {
                last_applied,
                buffered,
                resync,
            } => {
                drop(stream);
                if buffered == 1 || resync.is_some() {
                    self.diagnostics.emit(Diagnostic::TransportGap {
                        namespace: namespace.clone(),
                        last_applied,
                        received,
                        buffered,
                    });
                }
                match resync {
                    Some(reason) => {
                        self.dispatch_resync(&namespace, last_applied, reason);
                        EnvelopeReceipt::ResyncRequested
                    }
                    None => EnvelopeReceipt::Buffered,
                }
            }
            EnvelopeOutcome::Duplicate => EnvelopeReceipt::Duplicate,
            EnvelopeOutcome::Filtered => EnvelopeReceipt::Filtered,
        }
    }

    fn report_undecodable(&self, namespace: &str, rejected: Vec<SyncError>) {
        for error in rejected {
            self.diagnostics.emit(Diagnostic::MutationRejected {
                namespace: namespace.to_string(),
                origin: Origin::Stream,
                reason: error.to_string(),
            });
        }
    }

    pub fn last_applied(&self, namespace: &str) -> Option<u64> {
        self.stream.lock().last_applied(namespace)
    }

    /// Set a namespace's watermark without applying anything.
    pub fn seed_watermark(&self, namespace: &str, sequence: u64) {
        self.stream.lock().seed_watermark(namespace, sequence);
    }

    /// Ask the transport for a full resync of `namespace`.
    pub fn request_resync(&self, namespace: &str) {
        let last_applied = self.stream.lock().mark_resync_pending(namespace);
        self.dispatch_resync(namespace, last_applied, ResyncReason::Manual);
    }

    fn dispatch_resync(&self, namespace: &str, last_applied: Option<u64>, reason: ResyncReason) {
        self.diagnostics.emit(Diagnostic::ResyncRequested {
            namespace: namespace.to_string(),
            last_applied,
            reason,
        });
        match &self.resync {
            Some(handler) => handler.request_resync(namespace, last_applied),
            None => warn!(
                target: "syncstore::engine",
                namespace = %namespace, "Resync needed but no handler is configured"
            ),
        }
    }

    /// Install the authoritative value of `namespace` at `sequence` and
    /// apply any buffered envelopes after it.
    pub fn resync_complete(&self, namespace: &str, value: Value, sequence: u64) -> Vec<Outcome> {
        let now = self.now();
        let mut stream = self.stream.lock();
        let outcome = stream.resync_complete(namespace, value, sequence, now);
        match outcome {
            EnvelopeOutcome::Applied {
                mutations,
                rejected,
            } => {
                let admission = self.admit(mutations);
                drop(stream);
                self.report_undecodable(namespace, rejected);
                self.drive(admission)
            }
            _ => Vec::new(),
        }
    }

    // --- Server cache ---

    /// A cache entry resolved with `data`.
    ///
    /// Returns `Ok(None)` when no binding feeds the store from this key or
    /// nothing changed, and [`SyncError::ReconciliationConflict`] when a
    /// manual binding kept the local value.
    pub fn on_cache_change(&self, cache_key: &str, data: Value) -> Result<Option<Outcome>> {
        self.on_cache_change_at(cache_key, data, self.now())
    }

    /// Like [`on_cache_change`](Self::on_cache_change) with an explicit
    /// resolution time.
    pub fn on_cache_change_at(
        &self,
        cache_key: &str,
        data: Value,
        resolved_at: Timestamp,
    ) -> Result<Option<Outcome>> {
        let descriptor = self
            .pipeline
            .lock()
            .bridge_mut()
            .on_cache_change(cache_key, data, resolved_at);
        let descriptor = match descriptor {
            Some(d) => d,
            None => return Ok(None),
        };

        match self.apply(descriptor)? {
            Outcome::Conflict {
                namespace,
                cache_key,
                ..
            } => Err(SyncError::ReconciliationConflict {
                namespace,
                cache_key,
            }),
            other => Ok(Some(other)),
        }
    }

    /// Bind a cache key at runtime. Replaces any binding for the same key.
    pub fn bind_cache(&self, binding: CacheBinding) -> Result<()> {
        if binding.cache_key.is_empty() || binding.namespace.is_empty() {
            return Err(SyncError::InvalidConfig(
                "cache bindings need a cacheKey and a namespace".into(),
            ));
        }
        debug!(
            target: "syncstore::cache",
            cache_key = %binding.cache_key, namespace = %binding.namespace, "Binding cache key"
        );
        self.pipeline.lock().bridge_mut().add_binding(binding);
        Ok(())
    }

    /// Remove the binding for `cache_key`, returning it if there was one.
    pub fn unbind_cache(&self, cache_key: &str) -> Option<CacheBinding> {
        self.pipeline.lock().bridge_mut().remove_binding(cache_key)
    }

    pub fn cache_bindings(&self) -> Vec<CacheBinding> {
        self.pipeline.lock().bridge().bindings().to_vec()
    }

    /// Read a cache entry and feed the result back in.
    pub fn refresh(&self, cache_key: &str) -> Result<Option<Outcome>> {
        match self.server_cache.read(cache_key) {
            CacheRead::Fresh(value) | CacheRead::Stale(value) => self.on_cache_change(cache_key, value),
            CacheRead::Missing => Ok(None),
            CacheRead::Error(error) => {
                warn!(
                    target: "syncstore::cache",
                    cache_key, error = %error, "Cache read failed"
                );
                self.diagnostics.emit(Diagnostic::CacheReadFailed {
                    cache_key: cache_key.to_string(),
                    error,
                });
                Ok(None)
            }
        }
    }

    // --- Optimistic updates ---

    /// Settle a manual conflict and clear its marker.
    pub fn resolve_conflict(&self, namespace: &str, resolution: ConflictResolution) -> Result<Outcome> {
        let conflict = self
            .conflict(namespace)
            .ok_or_else(|| SyncError::NoConflict(namespace.to_string()))?;
        let value = match resolution {
            ConflictResolution::KeepLocal => conflict.local.clone(),
            ConflictResolution::TakeRemote => conflict.remote.clone(),
            ConflictResolution::Use(value) => value,
        };
        self.apply(MutationDescriptor::resolution(namespace, value, self.now()))
    }

    /// The server accepted the optimistic update with this correlation id.
    pub fn confirm_optimistic(&self, correlation_id: &CorrelationId) -> Result<()> {
        if self.pipeline.lock().bridge_mut().confirm(correlation_id) {
            Ok(())
        } else {
            Err(SyncError::UnknownCorrelation(correlation_id.to_string()))
        }
    }

    /// The server refused the optimistic update with this correlation id:
    /// restore the value from before it.
    pub fn reject_optimistic(&self, correlation_id: &CorrelationId) -> Result<Outcome> {
        let withdrawn = self
            .pipeline
            .lock()
            .bridge_mut()
            .withdraw(correlation_id)
            .ok_or_else(|| SyncError::UnknownCorrelation(correlation_id.to_string()))?;

        debug!(
            target: "syncstore::engine",
            namespace = %withdrawn.namespace,
            correlation_id = %correlation_id,
            "Rolling back optimistic update"
        );
        self.apply(MutationDescriptor::compensation(
            &withdrawn.namespace,
            (*withdrawn.pending.base).clone(),
            self.now(),
            correlation_id.clone(),
        ))
    }

    /// Report optimistic updates that have waited past the timeout. Each is
    /// reported once.
    pub fn check_stale_optimistic(&self) -> Vec<StaleOptimistic> {
        let stale = self
            .pipeline
            .lock()
            .bridge_mut()
            .stale(self.now(), self.config.optimistic_timeout());
        for s in &stale {
            warn!(
                target: "syncstore::cache",
                namespace = %s.namespace,
                correlation_id = %s.correlation_id,
                age_ms = s.age.as_millis() as u64,
                "Optimistic update still unconfirmed"
            );
            self.diagnostics.emit(Diagnostic::StaleOptimistic {
                namespace: s.namespace.clone(),
                correlation_id: s.correlation_id.to_string(),
                age_ms: s.age.as_millis() as u64,
            });
        }
        stale
    }

    // --- History ---

    /// Restore the value before the most recent recorded change.
    pub fn undo(&self) -> Option<HistorySnapshot> {
        let snapshot = self.pipeline.lock().history_mut().undo()?;
        self.replay(std::slice::from_ref(&snapshot));
        Some(snapshot)
    }

    /// Re-apply the most recently undone change.
    pub fn redo(&self) -> Option<HistorySnapshot> {
        let snapshot = self.pipeline.lock().history_mut().redo()?;
        self.replay(std::slice::from_ref(&snapshot));
        Some(snapshot)
    }

    /// Move to history position `position` (0 = before the oldest entry).
    pub fn jump(&self, position: usize) -> Vec<HistorySnapshot> {
        let snapshots = self.pipeline.lock().history_mut().jump(position);
        self.replay(&snapshots);
        snapshots
    }

    pub fn can_undo(&self) -> bool {
        self.pipeline.lock().history().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.pipeline.lock().history().can_redo()
    }

    /// (cursor, length)
    pub fn history_position(&self) -> (usize, usize) {
        let pipeline = self.pipeline.lock();
        (pipeline.history().cursor(), pipeline.history().len())
    }

    pub fn reset_history(&self) {
        self.pipeline.lock().history_mut().reset();
    }

    fn replay(&self, snapshots: &[HistorySnapshot]) {
        let now = self.now();
        let batch = snapshots
            .iter()
            .map(|s| MutationDescriptor::replay(&s.namespace, (*s.value).clone(), now))
            .collect();
        self.submit(batch);
    }

    // --- Timers and persistence ---

    /// Run time-driven work: debounced persistence, gap ageing and stale
    /// optimistic detection.
    pub fn tick(&self) {
        let now = self.now();
        {
            let mut pipeline = self.pipeline.lock();
            // Failures are already reported through diagnostics
            let _ = pipeline
                .persistence_mut()
                .flush_if_due(&self.store, &self.diagnostics, now);
        }

        let requests = self.stream.lock().poll(now);
        for request in requests {
            self.dispatch_resync(&request.namespace, request.last_applied, request.reason);
        }

        self.check_stale_optimistic();
    }

    /// Write persistable namespaces now. Returns whether a backend was written.
    pub fn flush_persistence(&self) -> Result<bool> {
        self.pipeline
            .lock()
            .persistence_mut()
            .flush(&self.store, &self.diagnostics, self.now())
    }

    /// Whether every backend failed and the session is memory-only.
    pub fn persistence_degraded(&self) -> bool {
        self.pipeline.lock().persistence().adapter().is_degraded()
    }

    // --- Diagnostics ---

    pub fn subscribe_diagnostics(&self, config: DiagnosticsConfig) -> DiagnosticsHandle {
        self.diagnostics.subscribe(config)
    }

    pub fn unsubscribe_diagnostics(&self, id: DiagnosticsId) {
        self.diagnostics.unsubscribe(id);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Best-effort flush on drop
        let dirty = self.pipeline.get_mut().persistence().adapter().is_dirty();
        if dirty {
            let _ = self.flush_persistence();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> (Engine, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let engine = Engine::builder(EngineConfig::default())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (engine, clock)
    }

    #[test]
    fn test_set_and_get() {
        let (engine, _) = engine();
        assert!(engine.get_state("a").is_none());
        engine.set_state("a", Patch::merge(json!({"x": 1}))).unwrap();
        assert_eq!(*engine.get_state("a").unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_malformed_leaves_state() {
        let (engine, _) = engine();
        engine.mount("list", json!([1]));
        let err = engine
            .set_state("list", Patch::Edit { index: 5, value: json!(0) })
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedMutation { .. }));
        assert_eq!(*engine.get_state("list").unwrap(), json!([1]));
    }

    #[test]
    fn test_reentrant_set_state_is_deferred() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let inner = Arc::clone(&engine);
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&outcomes);

        engine.subscribe(
            "counter",
            |v| v.value.get("n").and_then(Value::as_i64),
            move |n| {
                if *n == Some(1) {
                    let out = inner.set_state("mirror", Patch::Replace(json!(1))).unwrap();
                    seen.lock().push(matches!(out, Outcome::Deferred));
                }
            },
        );

        engine.set_state("counter", Patch::merge(json!({"n": 1}))).unwrap();
        assert_eq!(*outcomes.lock(), vec![true]);
        // Applied before the outer call returned
        assert_eq!(*engine.get_state("mirror").unwrap(), json!(1));
    }

    #[test]
    fn test_undo_redo() {
        let (engine, _) = engine();
        engine.set_state("a", Patch::Replace(json!(1))).unwrap();
        engine.set_state("a", Patch::Replace(json!(2))).unwrap();

        engine.undo().unwrap();
        assert_eq!(*engine.get_state("a").unwrap(), json!(1));
        engine.redo().unwrap();
        assert_eq!(*engine.get_state("a").unwrap(), json!(2));
        assert_eq!(engine.history_position(), (2, 2));
    }

    #[test]
    fn test_stale_optimistic_reported() {
        let clock = ManualClock::new(Timestamp::from_millis(0));
        let engine = Engine::builder(EngineConfig {
            cache_bindings: vec![crate::cache::CacheBinding::new(
                "k",
                "a",
                crate::cache::Direction::Bidirectional,
            )],
            ..Default::default()
        })
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
        let handle = engine.subscribe_diagnostics(DiagnosticsConfig::default());

        engine.set_state("a", Patch::merge(json!({"x": 1}))).unwrap();
        clock.advance(Duration::from_secs(31));
        engine.tick();

        assert!(handle
            .drain()
            .iter()
            .any(|d| matches!(d, Diagnostic::StaleOptimistic { .. })));
        assert!(engine.check_stale_optimistic().is_empty());
    }

    #[test]
    fn test_resolve_without_conflict() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.resolve_conflict("a", ConflictResolution::KeepLocal),
            Err(SyncError::NoConflict(_))
        ));
        assert!(matches!(
            engine.confirm_optimistic(&CorrelationId::from("nope")),
            Err(SyncError::UnknownCorrelation(_))
        ));
    }
}
