//! Bidirectional reconciliation between the store and the server cache.

use lru::LruCache;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::binding::{CacheBinding, ReconciliationRule, WriteMode};
use super::reconcile::{reconcile, PendingOptimistic, Reconciliation};
use super::CacheSideEffect;
use crate::types::{CorrelationId, MutationDescriptor, MutationId, MutationKind, Origin, Patch, Timestamp};

/// Recently resolved cache values kept for change detection.
const RESOLVED_CACHE_SIZE: usize = 256;

/// An optimistic update that has waited too long.
#[derive(Clone, Debug, PartialEq)]
pub struct StaleOptimistic {
    pub namespace: String,
    pub correlation_id: CorrelationId,
    pub age: Duration,
}

/// A cache resolution handed to the pipeline but not yet committed.
#[derive(Clone, Debug)]
struct InflightResolution {
    cache_key: String,
    data: Arc<Value>,
    resolved_at: Timestamp,
}

/// A pending optimistic update taken out of the bridge.
#[derive(Clone, Debug)]
pub struct Withdrawn {
    pub namespace: String,
    pub pending: PendingOptimistic,
}

/// Drives both directions of every [`CacheBinding`].
pub struct CacheBridge {
    bindings: Vec<CacheBinding>,
    default_rule: ReconciliationRule,
    /// Unconfirmed local intent per namespace.
    pending: HashMap<String, PendingOptimistic>,
    /// Last committed resolution per cache key.
    resolved: LruCache<String, Arc<Value>>,
    /// Cache-origin descriptors in flight, by id.
    inflight: HashMap<MutationId, InflightResolution>,
    /// Side effects coalesced for the current tick, in first-scheduled order.
    scheduled: Vec<CacheSideEffect>,
}

impl CacheBridge {
    pub fn new(bindings: Vec<CacheBinding>, default_rule: ReconciliationRule) -> Self {
        Self {
            bindings,
            default_rule,
            pending: HashMap::new(),
            resolved: LruCache::new(
                NonZeroUsize::new(RESOLVED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            inflight: HashMap::new(),
            scheduled: Vec::new(),
        }
    }

    pub fn bindings(&self) -> &[CacheBinding] {
        &self.bindings
    }

    /// Bind another cache key. A binding for an already bound key replaces it.
    pub fn add_binding(&mut self, binding: CacheBinding) {
        self.bindings.retain(|b| b.cache_key != binding.cache_key);
        self.bindings.push(binding);
    }

    /// Unbind a cache key. Pending intent on its namespace is kept while
    /// another binding still pushes that namespace to the cache.
    pub fn remove_binding(&mut self, cache_key: &str) -> Option<CacheBinding> {
        let index = self.bindings.iter().position(|b| b.cache_key == cache_key)?;
        let binding = self.bindings.remove(index);
        self.resolved.pop(cache_key);
        if !self.tracks_optimistic(&binding.namespace) {
            self.pending.remove(&binding.namespace);
        }
        Some(binding)
    }

    fn binding_for_key(&self, cache_key: &str) -> Option<&CacheBinding> {
        self.bindings.iter().find(|b| b.cache_key == cache_key)
    }

    fn rule_for(&self, binding: &CacheBinding) -> ReconciliationRule {
        binding.reconciliation_rule.unwrap_or(self.default_rule)
    }

    /// Whether local writes to `namespace` are optimistic (pushed to the cache).
    pub fn tracks_optimistic(&self, namespace: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.namespace == namespace && b.direction.feeds_cache())
    }

    // --- Store -> cache ---

    /// React to a committed store mutation: schedule cache side effects and
    /// track optimistic intent. Returns the effects this mutation produced.
    pub fn on_store_change(
        &mut self,
        mutation: &MutationDescriptor,
        preceding: &Arc<Value>,
        resulting: &Arc<Value>,
    ) -> Vec<CacheSideEffect> {
        let namespace = mutation.namespace();
        let mut effects = Vec::new();

        for binding in self.bindings.iter().filter(|b| b.namespace == namespace) {
            if !binding.direction.feeds_cache() {
                continue;
            }
            let effect = match mutation.origin() {
                Origin::Local => match binding.write_mode {
                    WriteMode::OptimisticWrite => CacheSideEffect::Write {
                        cache_key: binding.cache_key.clone(),
                        value: (**resulting).clone(),
                    },
                    WriteMode::Invalidate => CacheSideEffect::Invalidate {
                        cache_key: binding.cache_key.clone(),
                    },
                },
                Origin::Stream | Origin::Peer => CacheSideEffect::Invalidate {
                    cache_key: binding.cache_key.clone(),
                },
                Origin::Cache => continue,
            };
            effects.push(effect);
        }

        if mutation.origin() == Origin::Local && self.tracks_optimistic(namespace) {
            match mutation.kind() {
                MutationKind::Compensation | MutationKind::Resolution => {
                    self.pending.remove(namespace);
                }
                MutationKind::Forward | MutationKind::Replay => {
                    let fields = mutation.patch().touched_fields();
                    let corr = mutation.correlation_id().clone();
                    match self.pending.get_mut(namespace) {
                        Some(p) => p.extend(corr, Arc::clone(resulting), fields, mutation.timestamp()),
                        None => {
                            self.pending.insert(
                                namespace.to_string(),
                                PendingOptimistic::open(
                                    corr,
                                    Arc::clone(preceding),
                                    Arc::clone(resulting),
                                    fields,
                                    mutation.timestamp(),
                                ),
                            );
                        }
                    }
                }
            }
        }

        for effect in &effects {
            self.schedule(effect.clone());
        }
        effects
    }

    /// Coalesce into this tick's batch. A write supersedes an invalidate for
    /// the same key; among writes the last one wins.
    fn schedule(&mut self, effect: CacheSideEffect) {
        match self
            .scheduled
            .iter_mut()
            .find(|e| e.cache_key() == effect.cache_key())
        {
            Some(existing) => {
                if let CacheSideEffect::Write { .. } = effect {
                    *existing = effect;
                }
            }
            None => self.scheduled.push(effect),
        }
    }

    /// Take the coalesced side effects for dispatch.
    pub fn take_scheduled(&mut self) -> Vec<CacheSideEffect> {
        std::mem::take(&mut self.scheduled)
    }

    // --- Cache -> store ---

    /// Turn a cache resolution into a cache-origin mutation.
    ///
    /// Returns `None` if no binding feeds the store from this key, or if the
    /// value is identical to the last resolution and nothing is pending.
    pub fn on_cache_change(
        &mut self,
        cache_key: &str,
        data: Value,
        resolved_at: Timestamp,
    ) -> Option<MutationDescriptor> {
        let binding = self.binding_for_key(cache_key)?;
        if !binding.direction.feeds_store() {
            return None;
        }
        let namespace = binding.namespace.clone();

        let unchanged = self
            .resolved
            .get(cache_key)
            .map(|prev| **prev == data)
            .unwrap_or(false);
        if unchanged && !self.pending.contains_key(&namespace) {
            debug!(
                target: "syncstore::cache",
                cache_key, "Cache resolution unchanged, skipping"
            );
            return None;
        }

        let desc = MutationDescriptor::cache(&namespace, Patch::Replace(data.clone()), resolved_at);
        self.inflight.insert(
            desc.id(),
            InflightResolution {
                cache_key: cache_key.to_string(),
                data: Arc::new(data),
                resolved_at,
            },
        );
        Some(desc)
    }

    /// Settle a cache-origin descriptor against the current local value.
    ///
    /// Clears pending intent unless the result is a conflict.
    pub fn reconcile_incoming(
        &mut self,
        mutation: &MutationDescriptor,
        local: &Value,
        remote: &Value,
    ) -> Reconciliation {
        let namespace = mutation.namespace();
        let (cache_key, resolved_at) = self
            .inflight
            .get(&mutation.id())
            .map(|r| (r.cache_key.clone(), r.resolved_at))
            .unwrap_or_else(|| (String::new(), mutation.timestamp()));

        let rule = self
            .binding_for_key(&cache_key)
            .map(|b| self.rule_for(b))
            .unwrap_or(self.default_rule);

        let result = reconcile(
            rule,
            &cache_key,
            local,
            remote,
            resolved_at,
            self.pending.get(namespace),
        );

        if let Reconciliation::Adopt(_) = result {
            self.pending.remove(namespace);
        }
        result
    }

    /// A cache-origin descriptor committed: remember its resolution so an
    /// identical one can be skipped.
    pub fn settle_inflight(&mut self, id: MutationId) {
        if let Some(r) = self.inflight.remove(&id) {
            self.resolved.put(r.cache_key, r.data);
        }
    }

    /// Forget a cache-origin descriptor that was halted before commit.
    pub fn discard_inflight(&mut self, id: MutationId) {
        self.inflight.remove(&id);
    }

    /// Resolutions handed out but neither settled nor discarded.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    // --- Optimistic lifecycle ---

    /// A stream event echoing `correlation` confirms that intent.
    pub fn confirm_in(&mut self, namespace: &str, correlation: &CorrelationId) -> bool {
        let done = match self.pending.get_mut(namespace) {
            Some(p) if p.contains(correlation) => p.confirm(correlation),
            _ => return false,
        };
        if done {
            self.pending.remove(namespace);
        }
        true
    }

    /// Confirm by correlation id alone.
    pub fn confirm(&mut self, correlation: &CorrelationId) -> bool {
        let namespace = match self.namespace_of(correlation) {
            Some(ns) => ns,
            None => return false,
        };
        self.confirm_in(&namespace, correlation)
    }

    /// Remove the pending update containing `correlation` so it can be
    /// rolled back.
    pub fn withdraw(&mut self, correlation: &CorrelationId) -> Option<Withdrawn> {
        let namespace = self.namespace_of(correlation)?;
        let pending = self.pending.remove(&namespace)?;
        Some(Withdrawn { namespace, pending })
    }

    /// Drop pending intent for a namespace.
    pub fn clear_pending(&mut self, namespace: &str) {
        self.pending.remove(namespace);
    }

    fn namespace_of(&self, correlation: &CorrelationId) -> Option<String> {
        self.pending
            .iter()
            .find(|(_, p)| p.contains(correlation))
            .map(|(ns, _)| ns.clone())
    }

    pub fn pending(&self, namespace: &str) -> Option<&PendingOptimistic> {
        self.pending.get(namespace)
    }

    /// Pending updates older than `timeout` that have not been reported yet.
    pub fn stale(&mut self, now: Timestamp, timeout: Duration) -> Vec<StaleOptimistic> {
        let mut out = Vec::new();
        for (namespace, p) in self.pending.iter_mut() {
            let age = now.since(p.issued_at);
            if !p.warned && age > timeout {
                p.warned = true;
                if let Some(corr) = p.correlations.last() {
                    out.push(StaleOptimistic {
                        namespace: namespace.clone(),
                        correlation_id: corr.clone(),
                        age,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Direction;
    use serde_json::json;

    fn bridge(rule: ReconciliationRule, mode: WriteMode) -> CacheBridge {
        CacheBridge::new(
            vec![CacheBinding::new("tickets/42", "board:ticket-42", Direction::Bidirectional)
                .with_rule(rule)
                .with_write_mode(mode)],
            ReconciliationRule::CacheWins,
        )
    }

    fn local(value: Value, at: i64) -> MutationDescriptor {
        MutationDescriptor::local("board:ticket-42", Patch::merge(value), Timestamp(at))
    }

    #[test]
    fn test_local_change_schedules_write_and_tracks_pending() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::OptimisticWrite);
        let m = local(json!({"status": "done"}), 10);
        let effects = b.on_store_change(
            &m,
            &Arc::new(json!({"status": "todo"})),
            &Arc::new(json!({"status": "done"})),
        );

        assert_eq!(
            effects,
            vec![CacheSideEffect::Write {
                cache_key: "tickets/42".into(),
                value: json!({"status": "done"}),
            }]
        );
        let pending = b.pending("board:ticket-42").unwrap();
        assert_eq!(*pending.base, json!({"status": "todo"}));
        assert_eq!(pending.field_times["status"], Timestamp(10));
    }

    #[test]
    fn test_effects_coalesce_per_tick() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::Invalidate);
        for i in 0..5 {
            let m = local(json!({"n": i}), i);
            b.on_store_change(&m, &Arc::new(json!({})), &Arc::new(json!({"n": i})));
        }
        assert_eq!(
            b.take_scheduled(),
            vec![CacheSideEffect::Invalidate { cache_key: "tickets/42".into() }]
        );
        assert!(b.take_scheduled().is_empty());
    }

    #[test]
    fn test_write_supersedes_invalidate() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::OptimisticWrite);
        let stream = MutationDescriptor::stream(
            "board:ticket-42",
            Patch::merge(json!({"a": 1})),
            Timestamp(0),
            3,
            None,
        );
        b.on_store_change(&stream, &Arc::new(json!({})), &Arc::new(json!({"a": 1})));
        b.on_store_change(&local(json!({"a": 2}), 1), &Arc::new(json!({"a": 1})), &Arc::new(json!({"a": 2})));

        assert_eq!(
            b.take_scheduled(),
            vec![CacheSideEffect::Write {
                cache_key: "tickets/42".into(),
                value: json!({"a": 2}),
            }]
        );
    }

    #[test]
    fn test_unchanged_resolution_skipped() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::Invalidate);
        let first = b.on_cache_change("tickets/42", json!({"a": 1}), Timestamp(0)).unwrap();
        b.settle_inflight(first.id());
        assert!(b.on_cache_change("tickets/42", json!({"a": 1}), Timestamp(1)).is_none());
        assert!(b.on_cache_change("tickets/42", json!({"a": 2}), Timestamp(2)).is_some());
        assert!(b.on_cache_change("unknown", json!(1), Timestamp(2)).is_none());
    }

    #[test]
    fn test_discarded_resolution_is_not_remembered() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::Invalidate);
        let first = b.on_cache_change("tickets/42", json!({"a": 1}), Timestamp(0)).unwrap();
        assert_eq!(b.inflight_len(), 1);
        b.discard_inflight(first.id());
        assert_eq!(b.inflight_len(), 0);

        // Never committed, so the same value is offered again
        assert!(b.on_cache_change("tickets/42", json!({"a": 1}), Timestamp(1)).is_some());
    }

    #[test]
    fn test_add_and_remove_binding() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::Invalidate);
        b.add_binding(CacheBinding::new("users/7", "user:7", Direction::ToStore));
        assert_eq!(b.bindings().len(), 2);
        assert!(b.on_cache_change("users/7", json!({"name": "ada"}), Timestamp(0)).is_some());

        // Rebinding a key replaces it
        b.add_binding(CacheBinding::new("users/7", "user:7", Direction::ToCache));
        assert_eq!(b.bindings().len(), 2);
        assert!(b.on_cache_change("users/7", json!({"name": "bob"}), Timestamp(1)).is_none());

        b.on_store_change(&local(json!({"a": 1}), 0), &Arc::new(json!({})), &Arc::new(json!({"a": 1})));
        assert!(b.pending("board:ticket-42").is_some());
        assert!(b.remove_binding("tickets/42").is_some());
        assert!(b.pending("board:ticket-42").is_none());
        assert!(b.remove_binding("tickets/42").is_none());
    }

    #[test]
    fn test_to_cache_binding_ignores_resolutions() {
        let mut b = CacheBridge::new(
            vec![CacheBinding::new("k", "ns", Direction::ToCache)],
            ReconciliationRule::CacheWins,
        );
        assert!(b.on_cache_change("k", json!(1), Timestamp(0)).is_none());
    }

    #[test]
    fn test_confirm_and_withdraw() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::Invalidate);
        let m = local(json!({"a": 1}), 0).with_correlation(CorrelationId::from("c1"));
        b.on_store_change(&m, &Arc::new(json!({})), &Arc::new(json!({"a": 1})));

        assert!(!b.confirm(&CorrelationId::from("nope")));
        let withdrawn = b.withdraw(&CorrelationId::from("c1")).unwrap();
        assert_eq!(withdrawn.namespace, "board:ticket-42");
        assert_eq!(*withdrawn.pending.base, json!({}));
        assert!(b.pending("board:ticket-42").is_none());
    }

    #[test]
    fn test_stale_reported_once() {
        let mut b = bridge(ReconciliationRule::CacheWins, WriteMode::Invalidate);
        b.on_store_change(&local(json!({"a": 1}), 0), &Arc::new(json!({})), &Arc::new(json!({"a": 1})));

        assert!(b.stale(Timestamp::from_millis(10), Duration::from_secs(1)).is_empty());
        assert_eq!(b.stale(Timestamp::from_millis(2_000), Duration::from_secs(1)).len(), 1);
        assert!(b.stale(Timestamp::from_millis(3_000), Duration::from_secs(1)).is_empty());
    }
}
