//! The mutation pipeline.
//!
//! Every state change, whatever its origin, runs through the same fixed
//! list of stages:
//!
//! ```text
//! inbound-transform -> persistence-gate -> cache-bridge -> history-record -> core-commit
//! ```
//!
//! A tick is one batch of descriptors. Within a tick descriptors are applied
//! local first, then cache, then stream and peer, keeping submission order
//! inside each group. After every descriptor has been processed each stage
//! gets an `end_tick` call, which is where cache side effects are collected.

mod stage;
mod stages;

pub use stage::{Halt, Stage, StageContext, StageOutcome, StagedMutation};
pub use stages::{
    CacheBridgeStage, CoreCommit, HistoryRecord, InboundTransform, PersistenceGate, Validator,
};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheBridge, CacheSideEffect};
use crate::diagnostics::Diagnostic;
use crate::error::SyncError;
use crate::history::HistoryTracker;
use crate::persistence::PersistenceAdapter;
use crate::subscriptions::NamespaceView;
use crate::types::{CorrelationId, MutationDescriptor, MutationId, Origin};

/// What happened to one submitted descriptor.
#[derive(Debug)]
pub enum Outcome {
    /// The namespace changed; `version` is its new version.
    Committed {
        id: MutationId,
        namespace: String,
        version: u64,
    },
    /// Went through every stage but changed nothing observable.
    Unchanged { id: MutationId },
    /// Kept the local value and attached a conflict marker.
    Conflict {
        id: MutationId,
        namespace: String,
        cache_key: String,
    },
    Rejected { id: MutationId, error: SyncError },
    /// Replaced by a stream or peer echo of the same correlation id.
    Superseded { id: MutationId, by: MutationId },
    /// Submitted while a tick was running; applied before the running tick's
    /// caller returns.
    Deferred,
}

impl Outcome {
    pub fn id(&self) -> Option<MutationId> {
        match self {
            Outcome::Committed { id, .. }
            | Outcome::Unchanged { id }
            | Outcome::Conflict { id, .. }
            | Outcome::Rejected { id, .. }
            | Outcome::Superseded { id, .. } => Some(*id),
            Outcome::Deferred => None,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed { .. })
    }
}

/// Everything a tick produced that must be dispatched once the pipeline is
/// released.
#[derive(Debug, Default)]
pub struct TickReport {
    /// One per descriptor, in application order.
    pub outcomes: Vec<Outcome>,
    /// Views to deliver to subscribers, in commit order.
    pub notifications: Vec<(String, NamespaceView)>,
    pub cache_effects: Vec<CacheSideEffect>,
}

/// The fixed stage list.
pub struct Pipeline {
    inbound: InboundTransform,
    persistence: PersistenceGate,
    cache: CacheBridgeStage,
    history: HistoryRecord,
    commit: CoreCommit,
}

impl Pipeline {
    pub fn new(persistence: PersistenceAdapter, bridge: CacheBridge, history: HistoryTracker) -> Self {
        Self {
            inbound: InboundTransform::default(),
            persistence: PersistenceGate::new(persistence),
            cache: CacheBridgeStage::new(bridge),
            history: HistoryRecord::new(history),
            commit: CoreCommit,
        }
    }

    pub fn inbound_mut(&mut self) -> &mut InboundTransform {
        &mut self.inbound
    }

    pub fn persistence(&self) -> &PersistenceGate {
        &self.persistence
    }

    pub fn persistence_mut(&mut self) -> &mut PersistenceGate {
        &mut self.persistence
    }

    pub fn bridge(&self) -> &CacheBridge {
        self.cache.bridge()
    }

    pub fn bridge_mut(&mut self) -> &mut CacheBridge {
        self.cache.bridge_mut()
    }

    pub fn history(&self) -> &HistoryTracker {
        self.history.tracker()
    }

    pub fn history_mut(&mut self) -> &mut HistoryTracker {
        self.history.tracker_mut()
    }

    fn stages_mut(&mut self) -> [&mut dyn Stage; 5] {
        [
            &mut self.inbound,
            &mut self.persistence,
            &mut self.cache,
            &mut self.history,
            &mut self.commit,
        ]
    }

    /// Stage names in execution order.
    pub fn stage_names(&mut self) -> Vec<&'static str> {
        self.stages_mut().iter().map(|s| s.name()).collect()
    }

    /// Run one tick over `batch`.
    pub fn run_tick(&mut self, mut batch: Vec<MutationDescriptor>, ctx: &StageContext<'_>) -> TickReport {
        batch.sort_by_key(|d| d.origin().rank());
        let superseded = find_superseded(&batch);

        let mut report = TickReport::default();
        for descriptor in batch {
            let preceding = ctx.store.value_or_null(descriptor.namespace());
            let mut staged = StagedMutation::new(descriptor, preceding);
            staged.superseded_by = superseded.get(&staged.descriptor.id()).copied();

            let outcome = self.run_one(staged, ctx, &mut report);
            report.outcomes.push(outcome);
        }

        for stage in self.stages_mut() {
            stage.end_tick(ctx, &mut report);
        }
        report
    }

    fn run_one(
        &mut self,
        staged: StagedMutation,
        ctx: &StageContext<'_>,
        report: &mut TickReport,
    ) -> Outcome {
        let descriptor = Arc::clone(&staged.descriptor);
        let id = descriptor.id();
        let origin = descriptor.origin();
        let namespace = staged.namespace().to_string();

        let mut current = Some(staged);
        let mut halt = None;
        for stage in self.stages_mut() {
            let Some(staged) = current.take() else { break };
            match stage.process(staged, ctx) {
                StageOutcome::Continue(next) => current = Some(next),
                StageOutcome::Halt(h) => {
                    debug!(
                        target: "syncstore::pipeline",
                        stage = stage.name(), namespace = %namespace, ?h, "Halted"
                    );
                    halt = Some(h);
                    break;
                }
            }
        }

        if halt.is_some() {
            for stage in self.stages_mut() {
                stage.halted(&descriptor, ctx);
            }
        }

        let staged = match (current, halt) {
            (_, Some(Halt::Superseded { by })) => return Outcome::Superseded { id, by },
            (_, Some(Halt::Rejected(error))) => {
                // Local callers get the error back directly
                if origin != Origin::Local {
                    ctx.diagnostics.emit(Diagnostic::MutationRejected {
                        namespace,
                        origin,
                        reason: error.to_string(),
                    });
                }
                return Outcome::Rejected { id, error };
            }
            (Some(staged), None) => staged,
            (None, None) => return Outcome::Unchanged { id },
        };

        for stage in self.stages_mut() {
            stage.committed(&staged, ctx);
        }

        if let Some(view) = &staged.committed_view {
            report.notifications.push((namespace.clone(), view.clone()));
        }

        match (staged.surfaced, staged.committed_view) {
            (Some(SyncError::ReconciliationConflict { namespace, cache_key }), _) => {
                Outcome::Conflict {
                    id,
                    namespace,
                    cache_key,
                }
            }
            (_, Some(view)) => Outcome::Committed {
                id,
                namespace,
                version: view.version,
            },
            _ => Outcome::Unchanged { id },
        }
    }
}

/// Local descriptors replaced by a stream or peer descriptor with the same
/// namespace and correlation id in the same batch.
fn find_superseded(batch: &[MutationDescriptor]) -> HashMap<MutationId, MutationId> {
    let echoes: HashMap<(&str, &CorrelationId), MutationId> = batch
        .iter()
        .filter(|d| matches!(d.origin(), Origin::Stream | Origin::Peer) && d.sequence().is_some())
        .map(|d| ((d.namespace(), d.correlation_id()), d.id()))
        .collect();

    if echoes.is_empty() {
        return HashMap::new();
    }

    batch
        .iter()
        .filter(|d| d.origin() == Origin::Local)
        .filter_map(|d| {
            echoes
                .get(&(d.namespace(), d.correlation_id()))
                .map(|by| (d.id(), *by))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBinding, Direction, ReconciliationRule};
    use crate::diagnostics::DiagnosticsManager;
    use crate::persistence::PersistenceConfig;
    use crate::state::StateStore;
    use crate::types::{Patch, Timestamp};
    use serde_json::json;

    struct Harness {
        store: StateStore,
        diagnostics: DiagnosticsManager,
        pipeline: Pipeline,
    }

    impl Harness {
        fn new(bindings: Vec<CacheBinding>) -> Self {
            Self {
                store: StateStore::new(),
                diagnostics: DiagnosticsManager::new(),
                pipeline: Pipeline::new(
                    PersistenceAdapter::new(PersistenceConfig::default(), vec![]),
                    CacheBridge::new(bindings, ReconciliationRule::CacheWins),
                    HistoryTracker::new(10),
                ),
            }
        }

        fn tick(&mut self, batch: Vec<MutationDescriptor>) -> TickReport {
            let ctx = StageContext {
                store: &self.store,
                diagnostics: &self.diagnostics,
                now: Timestamp(0),
            };
            self.pipeline.run_tick(batch, &ctx)
        }
    }

    fn local(ns: &str, value: serde_json::Value) -> MutationDescriptor {
        MutationDescriptor::local(ns, Patch::merge(value), Timestamp(0))
    }

    #[test]
    fn test_stage_order() {
        let mut h = Harness::new(vec![]);
        assert_eq!(
            h.pipeline.stage_names(),
            vec![
                "inbound-transform",
                "persistence-gate",
                "cache-bridge",
                "history-record",
                "core-commit"
            ]
        );
    }

    #[test]
    fn test_tie_break_local_cache_stream() {
        let mut h = Harness::new(vec![]);
        let stream = MutationDescriptor::stream("a", Patch::Replace(json!("stream")), Timestamp(0), 1, None);
        let cache = MutationDescriptor::cache("a", Patch::Replace(json!("cache")), Timestamp(0));
        let local = MutationDescriptor::local("a", Patch::Replace(json!("local")), Timestamp(0));
        let ids = (local.id(), cache.id(), stream.id());

        let report = h.tick(vec![stream, cache, local]);
        let order: Vec<_> = report.outcomes.iter().filter_map(Outcome::id).collect();
        assert_eq!(order, vec![ids.0, ids.1, ids.2]);
        assert_eq!(*h.store.value_or_null("a"), json!("stream"));
        assert_eq!(report.notifications.len(), 3);
    }

    #[test]
    fn test_stream_echo_supersedes_local() {
        let mut h = Harness::new(vec![]);
        let corr = CorrelationId::from("c-1");
        let local = local("t", json!({"status": "done"})).with_correlation(corr.clone());
        let echo = MutationDescriptor::stream(
            "t",
            Patch::merge(json!({"status": "done", "by": "server"})),
            Timestamp(0),
            9,
            Some(corr),
        );
        let echo_id = echo.id();

        let report = h.tick(vec![local, echo]);
        assert!(matches!(report.outcomes[0], Outcome::Superseded { by, .. } if by == echo_id));
        assert!(report.outcomes[1].is_committed());
        assert_eq!(*h.store.value_or_null("t"), json!({"status": "done", "by": "server"}));
        assert_eq!(h.pipeline.history().len(), 1);
    }

    #[test]
    fn test_peer_echo_supersedes_local() {
        let mut h = Harness::new(vec![]);
        let corr = CorrelationId::from("tab-2");
        let local = local("t", json!({"open": true})).with_correlation(corr.clone());
        let echo = MutationDescriptor::peer("t", Patch::merge(json!({"open": true})), Timestamp(0), Some(3))
            .with_correlation(corr);
        let echo_id = echo.id();

        let report = h.tick(vec![echo, local]);
        assert!(matches!(report.outcomes[0], Outcome::Superseded { by, .. } if by == echo_id));
        assert!(report.outcomes[1].is_committed());
    }

    #[test]
    fn test_halted_cache_resolution_is_discarded() {
        let mut h = Harness::new(vec![CacheBinding::new("k", "a", Direction::ToStore)]);
        h.pipeline.inbound_mut().add_validator(
            "a".into(),
            Box::new(|_ns: &str, v: &serde_json::Value| {
                if v.get("ok").is_some() {
                    Ok(())
                } else {
                    Err("ok required".to_string())
                }
            }),
        );

        let rejected = h
            .pipeline
            .bridge_mut()
            .on_cache_change("k", json!({"bad": 1}), Timestamp(0))
            .unwrap();
        let report = h.tick(vec![rejected]);
        assert!(matches!(report.outcomes[0], Outcome::Rejected { .. }));
        assert_eq!(h.pipeline.bridge().inflight_len(), 0);

        let accepted = h
            .pipeline
            .bridge_mut()
            .on_cache_change("k", json!({"ok": 1}), Timestamp(1))
            .unwrap();
        assert!(h.tick(vec![accepted]).outcomes[0].is_committed());
        assert_eq!(h.pipeline.bridge().inflight_len(), 0);
        // Committed, so an identical resolution is now skipped
        assert!(h
            .pipeline
            .bridge_mut()
            .on_cache_change("k", json!({"ok": 1}), Timestamp(2))
            .is_none());
    }

    #[test]
    fn test_malformed_rejected_without_commit() {
        let mut h = Harness::new(vec![]);
        h.store.mount("list", json!([1, 2]));
        let handle = h.diagnostics.subscribe_all();

        let bad = MutationDescriptor::peer("list", Patch::merge(json!({"x": 1})), Timestamp(0), None);
        let report = h.tick(vec![bad]);

        assert!(matches!(
            report.outcomes[0],
            Outcome::Rejected { error: SyncError::MalformedMutation { .. }, .. }
        ));
        assert_eq!(*h.store.value_or_null("list"), json!([1, 2]));
        assert!(matches!(handle.try_recv(), Ok(Diagnostic::MutationRejected { .. })));
        assert!(report.notifications.is_empty());
    }

    #[test]
    fn test_validator_halts() {
        let mut h = Harness::new(vec![]);
        h.pipeline.inbound_mut().add_validator(
            "board:*".into(),
            Box::new(|_ns: &str, v: &serde_json::Value| {
                if v.get("status").is_some() {
                    Ok(())
                } else {
                    Err("status required".to_string())
                }
            }),
        );

        let report = h.tick(vec![local("board:1", json!({"title": "x"}))]);
        assert!(matches!(report.outcomes[0], Outcome::Rejected { .. }));
        let report = h.tick(vec![local("other", json!({"title": "x"}))]);
        assert!(report.outcomes[0].is_committed());
    }

    #[test]
    fn test_noop_commit_not_recorded() {
        let mut h = Harness::new(vec![]);
        h.tick(vec![local("a", json!({"x": 1}))]);
        let report = h.tick(vec![local("a", json!({"x": 1}))]);
        assert!(matches!(report.outcomes[0], Outcome::Unchanged { .. }));
        assert_eq!(h.pipeline.history().len(), 1);
    }

    #[test]
    fn test_cache_effects_collected_at_tick_end() {
        let mut h = Harness::new(vec![CacheBinding::new("k", "a", Direction::ToCache)]);
        let report = h.tick(vec![local("a", json!({"x": 1})), local("a", json!({"x": 2}))]);
        assert_eq!(
            report.cache_effects,
            vec![CacheSideEffect::Invalidate { cache_key: "k".into() }]
        );
    }
}
