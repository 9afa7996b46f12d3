//! Optimistic bookkeeping and reconciliation rules.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::binding::ReconciliationRule;
use crate::subscriptions::Conflict;
use crate::types::{CorrelationId, Timestamp};

/// Local intent not yet confirmed by the server.
#[derive(Clone, Debug)]
pub struct PendingOptimistic {
    /// Correlation ids of the unconfirmed local mutations, oldest first.
    pub correlations: Vec<CorrelationId>,
    /// Namespace value before the first unconfirmed mutation.
    pub base: Arc<Value>,
    /// Latest optimistic value.
    pub value: Arc<Value>,
    /// Last local edit time per top-level field.
    pub field_times: HashMap<String, Timestamp>,
    /// Last local edit time of the whole value.
    pub touched_at: Timestamp,
    pub issued_at: Timestamp,
    /// Whether a stale warning was already emitted.
    pub warned: bool,
}

impl PendingOptimistic {
    pub fn open(
        correlation: CorrelationId,
        base: Arc<Value>,
        value: Arc<Value>,
        fields: Option<Vec<String>>,
        at: Timestamp,
    ) -> Self {
        let mut pending = Self {
            correlations: Vec::new(),
            base,
            value: Arc::clone(&value),
            field_times: HashMap::new(),
            touched_at: at,
            issued_at: at,
            warned: false,
        };
        pending.extend(correlation, value, fields, at);
        pending
    }

    /// Fold another local mutation into the pending update.
    pub fn extend(
        &mut self,
        correlation: CorrelationId,
        value: Arc<Value>,
        fields: Option<Vec<String>>,
        at: Timestamp,
    ) {
        let fields = fields.unwrap_or_else(|| match &*value {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        });
        for field in fields {
            self.field_times.insert(field, at);
        }
        self.touched_at = self.touched_at.max(at);
        self.value = value;
        self.correlations.push(correlation);
    }

    /// Confirm `correlation` and everything issued before it.
    /// Returns true when nothing remains pending.
    pub fn confirm(&mut self, correlation: &CorrelationId) -> bool {
        if let Some(pos) = self.correlations.iter().position(|c| c == correlation) {
            self.correlations.drain(..=pos);
        }
        self.correlations.is_empty()
    }

    pub fn contains(&self, correlation: &CorrelationId) -> bool {
        self.correlations.contains(correlation)
    }
}

/// Result of settling a resolved cache value against local state.
#[derive(Clone, Debug, PartialEq)]
pub enum Reconciliation {
    /// Commit this value.
    Adopt(Value),
    /// Keep the local value and mark the namespace.
    Conflict(Conflict),
}

/// Settle `remote` against the local value under `rule`.
///
/// `pending` is the namespace's unconfirmed local intent, if any. Without
/// it the remote value is simply adopted.
pub fn reconcile(
    rule: ReconciliationRule,
    cache_key: &str,
    local: &Value,
    remote: &Value,
    remote_at: Timestamp,
    pending: Option<&PendingOptimistic>,
) -> Reconciliation {
    let pending = match pending {
        Some(p) if local != remote => p,
        _ => return Reconciliation::Adopt(remote.clone()),
    };

    match rule {
        ReconciliationRule::CacheWins => Reconciliation::Adopt(remote.clone()),
        ReconciliationRule::Merge => {
            Reconciliation::Adopt(merge_by_time(local, remote, remote_at, pending))
        }
        ReconciliationRule::Manual => Reconciliation::Conflict(Conflict {
            cache_key: cache_key.to_string(),
            local: local.clone(),
            remote: remote.clone(),
            detected_at: remote_at,
        }),
    }
}

/// Field-level union. A field keeps its local value when the local edit is
/// strictly newer than `remote_at`; fields only one side has are kept.
fn merge_by_time(
    local: &Value,
    remote: &Value,
    remote_at: Timestamp,
    pending: &PendingOptimistic,
) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = Map::new();
            for (key, remote_value) in r {
                let local_newer = pending
                    .field_times
                    .get(key)
                    .map(|t| *t > remote_at)
                    .unwrap_or(false);
                if local_newer {
                    // A newer local removal keeps the field out
                    if let Some(v) = l.get(key) {
                        out.insert(key.clone(), v.clone());
                    }
                } else {
                    out.insert(key.clone(), remote_value.clone());
                }
            }
            for (key, local_value) in l {
                if !r.contains_key(key) {
                    out.insert(key.clone(), local_value.clone());
                }
            }
            Value::Object(out)
        }
        _ => {
            if pending.touched_at > remote_at {
                local.clone()
            } else {
                remote.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(fields: &[(&str, i64)], touched: i64) -> PendingOptimistic {
        let mut p = PendingOptimistic::open(
            CorrelationId::from("c1"),
            Arc::new(json!({})),
            Arc::new(json!({})),
            Some(vec![]),
            Timestamp(touched),
        );
        for (name, at) in fields {
            p.field_times.insert(name.to_string(), Timestamp(*at));
        }
        p
    }

    #[test]
    fn test_no_pending_adopts_remote() {
        let out = reconcile(
            ReconciliationRule::Manual,
            "k",
            &json!({"a": 1}),
            &json!({"a": 2}),
            Timestamp(0),
            None,
        );
        assert_eq!(out, Reconciliation::Adopt(json!({"a": 2})));
    }

    #[test]
    fn test_equal_values_confirm() {
        let p = pending(&[], 10);
        let out = reconcile(
            ReconciliationRule::Manual,
            "k",
            &json!({"a": 1}),
            &json!({"a": 1}),
            Timestamp(0),
            Some(&p),
        );
        assert_eq!(out, Reconciliation::Adopt(json!({"a": 1})));
    }

    #[test]
    fn test_cache_wins() {
        let p = pending(&[("status", 100)], 100);
        let out = reconcile(
            ReconciliationRule::CacheWins,
            "k",
            &json!({"status": "done"}),
            &json!({"status": "todo"}),
            Timestamp(50),
            Some(&p),
        );
        assert_eq!(out, Reconciliation::Adopt(json!({"status": "todo"})));
    }

    #[test]
    fn test_merge_by_field_time() {
        let p = pending(&[("status", 100), ("title", 10)], 100);
        let local = json!({"status": "done", "title": "old", "draft": true});
        let remote = json!({"status": "todo", "title": "new", "owner": "sam"});

        let out = reconcile(ReconciliationRule::Merge, "k", &local, &remote, Timestamp(50), Some(&p));
        assert_eq!(
            out,
            Reconciliation::Adopt(json!({
                "status": "done",
                "title": "new",
                "owner": "sam",
                "draft": true
            }))
        );
    }

    #[test]
    fn test_merge_scalar_uses_whole_time() {
        let p = pending(&[], 100);
        let out = reconcile(ReconciliationRule::Merge, "k", &json!(1), &json!(2), Timestamp(50), Some(&p));
        assert_eq!(out, Reconciliation::Adopt(json!(1)));

        let out = reconcile(ReconciliationRule::Merge, "k", &json!(1), &json!(2), Timestamp(500), Some(&p));
        assert_eq!(out, Reconciliation::Adopt(json!(2)));
    }

    #[test]
    fn test_manual_conflict() {
        let p = pending(&[], 100);
        match reconcile(ReconciliationRule::Manual, "k", &json!(1), &json!(2), Timestamp(5), Some(&p)) {
            Reconciliation::Conflict(c) => {
                assert_eq!(c.local, json!(1));
                assert_eq!(c.remote, json!(2));
                assert_eq!(c.cache_key, "k");
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_confirm_prefix() {
        let mut p = pending(&[], 0);
        p.extend(CorrelationId::from("c2"), Arc::new(json!({})), None, Timestamp(1));
        p.extend(CorrelationId::from("c3"), Arc::new(json!({})), None, Timestamp(2));

        assert!(!p.confirm(&CorrelationId::from("c2")));
        assert_eq!(p.correlations, vec![CorrelationId::from("c3")]);
        assert!(p.confirm(&CorrelationId::from("c3")));
    }
}
