//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::{CacheBinding, ReconciliationRule};
use crate::error::{Result, SyncError};
use crate::persistence::PersistenceConfig;
use crate::stream::{EnvelopeFilter, StreamConfig};
use crate::types::NamespacePattern;

/// Configuration for an [`Engine`](crate::Engine).
///
/// Deserializes from camelCase JSON; every field has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Namespaces written to durable storage (`name` or `prefix*`).
    pub persistable_namespaces: Vec<NamespacePattern>,

    /// Maximum history entries. 0 disables undo/redo.
    /// Default: 100
    pub history_limit: usize,

    pub cache_bindings: Vec<CacheBinding>,

    /// Rule for bindings that do not name their own.
    /// Default: cache-wins
    pub conflict_policy: ReconciliationRule,

    /// Backend key the snapshot is stored under.
    /// Default: "syncstore"
    pub persistence_key: String,

    /// Default: 250
    pub persist_debounce_ms: u64,

    /// Default: 256
    pub max_buffered_envelopes: usize,

    /// Default: 5000
    pub max_gap_age_ms: u64,

    /// Treat the first envelope of an unseeded namespace as its baseline
    /// instead of expecting sequence 1.
    /// Default: false
    pub adopt_first_sequence: bool,

    /// Inbound event-type and namespace allow-lists. Empty allows all.
    pub envelope_filter: EnvelopeFilter,

    /// Age after which an unconfirmed optimistic update is reported.
    /// Default: 30000
    pub optimistic_timeout_ms: u64,

    /// Per-subscriber diagnostics buffer.
    /// Default: 256
    pub diagnostics_buffer: usize,

    /// Load the persisted snapshot on creation.
    /// Default: true
    pub rehydrate: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistable_namespaces: Vec::new(),
            history_limit: 100,
            cache_bindings: Vec::new(),
            conflict_policy: ReconciliationRule::CacheWins,
            persistence_key: "syncstore".to_string(),
            persist_debounce_ms: 250,
            max_buffered_envelopes: 256,
            max_gap_age_ms: 5_000,
            adopt_first_sequence: false,
            envelope_filter: EnvelopeFilter::default(),
            optimistic_timeout_ms: 30_000,
            diagnostics_buffer: 256,
            rehydrate: true,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_envelopes == 0 {
            return Err(SyncError::InvalidConfig(
                "maxBufferedEnvelopes must be at least 1".into(),
            ));
        }
        if self.diagnostics_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "diagnosticsBuffer must be at least 1".into(),
            ));
        }
        if self.persistence_key.is_empty() {
            return Err(SyncError::InvalidConfig("persistenceKey is empty".into()));
        }
        for binding in &self.cache_bindings {
            if binding.cache_key.is_empty() || binding.namespace.is_empty() {
                return Err(SyncError::InvalidConfig(
                    "cache bindings need a cacheKey and a namespace".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_millis(self.optimistic_timeout_ms)
    }

    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            key: self.persistence_key.clone(),
            debounce: Duration::from_millis(self.persist_debounce_ms),
            persistable: self.persistable_namespaces.clone(),
        }
    }

    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            max_buffered_envelopes: self.max_buffered_envelopes,
            max_gap_age: Duration::from_millis(self.max_gap_age_ms),
            adopt_first_sequence: self.adopt_first_sequence,
            filter: self.envelope_filter.clone(),
        }
    }
}
