//! Cache bridge between store namespaces and the external server-state cache.
//!
//! Bindings declare which cache keys hold the same entity as which
//! namespaces. Local mutations become batched, fire-and-forget cache side
//! effects; cache resolutions become cache-origin mutations, reconciled
//! against any unconfirmed optimistic value by the binding's rule.

mod binding;
mod bridge;
mod reconcile;

pub use binding::{CacheBinding, Direction, ReconciliationRule, WriteMode};
pub use bridge::{CacheBridge, StaleOptimistic, Withdrawn};
pub use reconcile::{reconcile, PendingOptimistic, Reconciliation};

use serde_json::Value;

/// A request against the external cache, dispatched once per tick.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheSideEffect {
    Invalidate { cache_key: String },
    Write { cache_key: String, value: Value },
}

impl CacheSideEffect {
    pub fn cache_key(&self) -> &str {
        match self {
            CacheSideEffect::Invalidate { cache_key } | CacheSideEffect::Write { cache_key, .. } => {
                cache_key
            }
        }
    }
}

/// Result of reading a cache entry.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheRead {
    Fresh(Value),
    /// Served from cache while a refetch is under way.
    Stale(Value),
    Missing,
    Error(String),
}

/// The external server-state cache.
///
/// Calls are fire-and-forget from the engine's point of view; resolutions
/// come back through `Engine::on_cache_change`.
pub trait ServerCache: Send + Sync {
    fn invalidate(&self, cache_key: &str);
    fn write(&self, cache_key: &str, value: &Value);
    fn read(&self, cache_key: &str) -> CacheRead;
}

/// A cache that ignores everything. Used when no cache is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

impl ServerCache for NoopCache {
    fn invalidate(&self, _cache_key: &str) {}

    fn write(&self, _cache_key: &str, _value: &Value) {}

    fn read(&self, _cache_key: &str) -> CacheRead {
        CacheRead::Missing
    }
}
