//! The five built-in stages, in pipeline order.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::stage::{Halt, Stage, StageContext, StageOutcome, StagedMutation};
use super::TickReport;
use crate::cache::{CacheBridge, Reconciliation};
use crate::diagnostics::{Diagnostic, DiagnosticsManager};
use crate::error::{Result, SyncError};
use crate::history::HistoryTracker;
use crate::persistence::{PersistenceAdapter, Snapshot};
use crate::state::{apply_patch, ConflictUpdate, StateStore};
use crate::types::{MutationDescriptor, MutationKind, NamespacePattern, Origin, Timestamp};

/// Checks a candidate namespace value before it is committed.
pub trait Validator: Send + Sync {
    fn validate(&self, namespace: &str, value: &Value) -> std::result::Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&str, &Value) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, namespace: &str, value: &Value) -> std::result::Result<(), String> {
        self(namespace, value)
    }
}

// --- inbound-transform ---

/// Applies the patch to the preceding value and runs validators.
#[derive(Default)]
pub struct InboundTransform {
    validators: Vec<(NamespacePattern, Box<dyn Validator>)>,
}

impl InboundTransform {
    pub fn add_validator(&mut self, pattern: NamespacePattern, validator: Box<dyn Validator>) {
        self.validators.push((pattern, validator));
    }
}

impl Stage for InboundTransform {
    fn name(&self) -> &'static str {
        "inbound-transform"
    }

    fn process(&mut self, mut staged: StagedMutation, _ctx: &StageContext<'_>) -> StageOutcome {
        if let Some(by) = staged.superseded_by {
            return StageOutcome::Halt(Halt::Superseded { by });
        }

        let namespace = staged.namespace().to_string();
        let next = match apply_patch(&namespace, &staged.preceding, staged.descriptor.patch()) {
            Ok(v) => v,
            Err(e) => return StageOutcome::Halt(Halt::Rejected(e)),
        };

        for (pattern, validator) in &self.validators {
            if !pattern.matches(&namespace) {
                continue;
            }
            if let Err(reason) = validator.validate(&namespace, &next) {
                return StageOutcome::Halt(Halt::Rejected(SyncError::malformed(&namespace, reason)));
            }
        }

        staged.next = Arc::new(next);
        let kind = staged.descriptor.kind();
        staged.record_history = matches!(kind, MutationKind::Forward | MutationKind::Resolution);
        if kind == MutationKind::Resolution {
            staged.conflict = ConflictUpdate::Clear;
        }
        StageOutcome::Continue(staged)
    }
}

// --- persistence-gate ---

/// Marks the snapshot dirty on commits to persistable namespaces and writes
/// it once the debounce window has passed.
pub struct PersistenceGate {
    adapter: PersistenceAdapter,
}

impl PersistenceGate {
    pub fn new(adapter: PersistenceAdapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &PersistenceAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut PersistenceAdapter {
        &mut self.adapter
    }

    /// Write the persistable namespaces now.
    pub fn flush(
        &mut self,
        store: &StateStore,
        diagnostics: &DiagnosticsManager,
        now: Timestamp,
    ) -> Result<bool> {
        self.adapter.clear_dirty();
        let adapter = &self.adapter;
        let namespaces = store.snapshot(|ns| adapter.is_persistable(ns));
        self.adapter.save(Snapshot::new(namespaces, now), diagnostics)
    }

    /// Write if the debounce deadline has passed.
    pub fn flush_if_due(
        &mut self,
        store: &StateStore,
        diagnostics: &DiagnosticsManager,
        now: Timestamp,
    ) -> Result<bool> {
        if !self.adapter.take_due(now) {
            return Ok(false);
        }
        self.flush(store, diagnostics, now)
    }
}

impl Stage for PersistenceGate {
    fn name(&self) -> &'static str {
        "persistence-gate"
    }

    fn process(&mut self, mut staged: StagedMutation, _ctx: &StageContext<'_>) -> StageOutcome {
        staged.persist = self.adapter.is_persistable(staged.namespace());
        StageOutcome::Continue(staged)
    }

    fn committed(&mut self, staged: &StagedMutation, ctx: &StageContext<'_>) {
        if staged.persist && staged.value_changed() {
            self.adapter.mark_dirty(ctx.now);
        }
    }

    fn end_tick(&mut self, ctx: &StageContext<'_>, _report: &mut TickReport) {
        // Failures were already reported as diagnostics
        let _ = self.flush_if_due(ctx.store, ctx.diagnostics, ctx.now);
    }
}

// --- cache-bridge ---

/// Reconciles cache resolutions and turns local commits into cache side
/// effects.
pub struct CacheBridgeStage {
    bridge: CacheBridge,
}

impl CacheBridgeStage {
    pub fn new(bridge: CacheBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &CacheBridge {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut CacheBridge {
        &mut self.bridge
    }
}

impl Stage for CacheBridgeStage {
    fn name(&self) -> &'static str {
        "cache-bridge"
    }

    fn process(&mut self, mut staged: StagedMutation, ctx: &StageContext<'_>) -> StageOutcome {
        if staged.descriptor.origin() != Origin::Cache {
            return StageOutcome::Continue(staged);
        }

        let descriptor = Arc::clone(&staged.descriptor);
        match self
            .bridge
            .reconcile_incoming(&descriptor, &staged.preceding, &staged.next)
        {
            Reconciliation::Adopt(value) => {
                staged.next = Arc::new(value);
                staged.conflict = ConflictUpdate::Clear;
            }
            Reconciliation::Conflict(conflict) => {
                warn!(
                    target: "syncstore::cache",
                    namespace = %descriptor.namespace(),
                    cache_key = %conflict.cache_key,
                    "Optimistic value diverges from cache, keeping local"
                );
                ctx.diagnostics.emit(Diagnostic::ReconciliationConflict {
                    namespace: descriptor.namespace().to_string(),
                    cache_key: conflict.cache_key.clone(),
                });
                staged.surfaced = Some(SyncError::ReconciliationConflict {
                    namespace: descriptor.namespace().to_string(),
                    cache_key: conflict.cache_key.clone(),
                });
                staged.next = Arc::clone(&staged.preceding);
                staged.conflict = ConflictUpdate::Set(conflict);
            }
        }
        StageOutcome::Continue(staged)
    }

    fn committed(&mut self, staged: &StagedMutation, _ctx: &StageContext<'_>) {
        let descriptor = &staged.descriptor;
        let namespace = descriptor.namespace();

        match (descriptor.origin(), descriptor.kind()) {
            (Origin::Stream, _) | (Origin::Peer, _) => {
                if self.bridge.confirm_in(namespace, descriptor.correlation_id()) {
                    debug!(
                        target: "syncstore::cache",
                        namespace = %namespace,
                        correlation_id = %descriptor.correlation_id(),
                        "Optimistic update confirmed by stream"
                    );
                }
            }
            (Origin::Cache, _) => self.bridge.settle_inflight(descriptor.id()),
            (Origin::Local, MutationKind::Resolution) => self.bridge.clear_pending(namespace),
            _ => {}
        }

        if staged.value_changed() {
            self.bridge
                .on_store_change(descriptor, &staged.preceding, &staged.next);
        }
    }

    fn halted(&mut self, descriptor: &MutationDescriptor, _ctx: &StageContext<'_>) {
        if descriptor.origin() == Origin::Cache {
            self.bridge.discard_inflight(descriptor.id());
        }
    }

    fn end_tick(&mut self, _ctx: &StageContext<'_>, report: &mut TickReport) {
        report.cache_effects.extend(self.bridge.take_scheduled());
    }
}

// --- history-record ---

/// Records committed forward changes for undo/redo.
pub struct HistoryRecord {
    tracker: HistoryTracker,
}

impl HistoryRecord {
    pub fn new(tracker: HistoryTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &HistoryTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut HistoryTracker {
        &mut self.tracker
    }
}

impl Stage for HistoryRecord {
    fn name(&self) -> &'static str {
        "history-record"
    }

    fn process(&mut self, staged: StagedMutation, _ctx: &StageContext<'_>) -> StageOutcome {
        StageOutcome::Continue(staged)
    }

    fn committed(&mut self, staged: &StagedMutation, ctx: &StageContext<'_>) {
        if staged.record_history && staged.value_changed() {
            self.tracker.record(
                Arc::clone(&staged.descriptor),
                Arc::clone(&staged.preceding),
                Arc::clone(&staged.next),
                ctx.now,
            );
        }
    }
}

// --- core-commit ---

/// Writes the value into the store.
#[derive(Default)]
pub struct CoreCommit;

impl Stage for CoreCommit {
    fn name(&self) -> &'static str {
        "core-commit"
    }

    fn process(&mut self, mut staged: StagedMutation, ctx: &StageContext<'_>) -> StageOutcome {
        staged.committed_view = ctx.store.commit(
            staged.descriptor.namespace(),
            Arc::clone(&staged.next),
            staged.conflict.clone(),
        );
        debug!(
            target: "syncstore::pipeline",
            namespace = %staged.namespace(),
            origin = ?staged.descriptor.origin(),
            changed = staged.committed_view.is_some(),
            "Committed"
        );
        StageOutcome::Continue(staged)
    }
}
