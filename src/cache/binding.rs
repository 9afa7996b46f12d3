//! Declarative mapping between cache keys and store namespaces.

use serde::{Deserialize, Serialize};

/// Which way changes flow through a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Cache resolutions update the store.
    ToStore,
    /// Store mutations update or invalidate the cache.
    ToCache,
    Bidirectional,
}

impl Direction {
    pub fn feeds_store(self) -> bool {
        matches!(self, Direction::ToStore | Direction::Bidirectional)
    }

    pub fn feeds_cache(self) -> bool {
        matches!(self, Direction::ToCache | Direction::Bidirectional)
    }
}

/// How a pending optimistic value and a resolved cache value are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconciliationRule {
    /// The resolved value replaces the optimistic one.
    #[default]
    CacheWins,
    /// Field-level union; each field comes from whichever side is newer.
    Merge,
    /// Keep the local value and attach a conflict marker.
    Manual,
}

/// What a qualifying local mutation does to the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    #[default]
    Invalidate,
    OptimisticWrite,
}

/// Declares that `cache_key` and `namespace` hold the same entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheBinding {
    pub cache_key: String,
    pub namespace: String,
    pub direction: Direction,
    /// Falls back to the engine-wide conflict policy when unset.
    #[serde(default)]
    pub reconciliation_rule: Option<ReconciliationRule>,
    #[serde(default)]
    pub write_mode: WriteMode,
}

impl CacheBinding {
    pub fn new(cache_key: &str, namespace: &str, direction: Direction) -> Self {
        Self {
            cache_key: cache_key.to_string(),
            namespace: namespace.to_string(),
            direction,
            reconciliation_rule: None,
            write_mode: WriteMode::default(),
        }
    }

    pub fn with_rule(mut self, rule: ReconciliationRule) -> Self {
        self.reconciliation_rule = Some(rule);
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }
}
