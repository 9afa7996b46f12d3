//! Debounced, multi-backend snapshot persistence.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::PersistenceBackend;
use super::codec::{self, Snapshot};
use crate::diagnostics::{Diagnostic, DiagnosticsManager};
use crate::error::{Result, SyncError};
use crate::types::{NamespacePattern, Timestamp};

/// A burst of commits is written no later than this many debounce windows
/// after the first one.
const MAX_DELAY_WINDOWS: u32 = 4;

/// Persistence settings.
#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    /// Backend key the snapshot is stored under.
    pub key: String,
    /// Trailing debounce window.
    /// Default: 250ms
    pub debounce: Duration,
    /// Namespaces that are persisted. Empty means none.
    pub persistable: Vec<NamespacePattern>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            key: "syncstore".to_string(),
            debounce: Duration::from_millis(250),
            persistable: Vec::new(),
        }
    }
}

/// Writes snapshots to the first working backend.
pub struct PersistenceAdapter {
    config: PersistenceConfig,
    backends: Vec<Arc<dyn PersistenceBackend>>,
    /// Every backend failed at least once; writes stay in memory.
    degraded: bool,
    /// Last snapshot handed to `save`, kept for memory-only mode.
    memory: Option<Snapshot>,
    last_hash: Option<String>,
    dirty_since: Option<Timestamp>,
    deadline: Option<Timestamp>,
}

impl PersistenceAdapter {
    pub fn new(config: PersistenceConfig, backends: Vec<Arc<dyn PersistenceBackend>>) -> Self {
        Self {
            config,
            backends,
            degraded: false,
            memory: None,
            last_hash: None,
            dirty_since: None,
            deadline: None,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn is_persistable(&self, namespace: &str) -> bool {
        self.config.persistable.iter().any(|p| p.matches(namespace))
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// Last snapshot accepted by `save`, whether or not it reached a backend.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.memory.as_ref()
    }

    /// Record a commit to a persistable namespace and push the trailing
    /// deadline out, capped at a few windows after the first commit.
    pub fn mark_dirty(&mut self, now: Timestamp) {
        let since = *self.dirty_since.get_or_insert(now);
        let trailing = now.saturating_add(self.config.debounce);
        let cap = since.saturating_add(self.config.debounce * MAX_DELAY_WINDOWS);
        self.deadline = Some(trailing.min(cap));
    }

    /// Whether the debounce deadline has passed. Clears the dirty flag when it
    /// has, so the caller is expected to save.
    pub fn take_due(&mut self, now: Timestamp) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.clear_dirty();
                true
            }
            _ => false,
        }
    }

    /// Clear pending dirtiness (the caller is saving right now).
    pub fn clear_dirty(&mut self) {
        self.dirty_since = None;
        self.deadline = None;
    }

    /// Write a snapshot.
    ///
    /// Returns `Ok(true)` if a backend was written, `Ok(false)` if the write
    /// was skipped (identical content, or memory-only mode). The first time
    /// every backend fails the error is returned and the adapter degrades.
    pub fn save(&mut self, snapshot: Snapshot, diagnostics: &DiagnosticsManager) -> Result<bool> {
        let hash = snapshot.content_hash()?;
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            debug!(target: "syncstore::persistence", "Snapshot unchanged, skipping write");
            return Ok(false);
        }

        let bytes = codec::encode(&snapshot)?;
        self.memory = Some(snapshot);

        if self.degraded || self.backends.is_empty() {
            self.last_hash = Some(hash);
            return Ok(false);
        }

        let mut last_error = None;
        for backend in &self.backends {
            match backend.set(&self.config.key, &bytes) {
                Ok(()) => {
                    debug!(
                        target: "syncstore::persistence",
                        backend = backend.name(), bytes = bytes.len(), "Snapshot written"
                    );
                    self.last_hash = Some(hash);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(
                        target: "syncstore::persistence",
                        backend = backend.name(), error = %e, "Backend write failed"
                    );
                    diagnostics.emit(Diagnostic::PersistenceFailure {
                        backend: backend.name().to_string(),
                        error: e.to_string(),
                    });
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no backend accepted the snapshot".into());
        warn!(
            target: "syncstore::persistence",
            error = %reason, "All backends failed, continuing in memory"
        );
        self.degraded = true;
        self.last_hash = Some(hash);
        diagnostics.emit(Diagnostic::PersistenceDegraded {
            error: reason.clone(),
        });
        Err(SyncError::PersistenceFailure(reason))
    }

    /// Read the snapshot from the first backend that has a valid one.
    ///
    /// Non-persistable namespaces are filtered out.
    pub fn load(&mut self, diagnostics: &DiagnosticsManager) -> Option<Snapshot> {
        for backend in &self.backends {
            let loaded = backend
                .get(&self.config.key)
                .and_then(|bytes| bytes.map(|b| codec::decode(&b)).transpose());

            match loaded {
                Ok(Some(mut snapshot)) => {
                    snapshot.namespaces.retain(|ns, _| {
                        self.config.persistable.iter().any(|p| p.matches(ns))
                    });
                    debug!(
                        target: "syncstore::persistence",
                        backend = backend.name(),
                        namespaces = snapshot.namespaces.len(),
                        "Snapshot loaded"
                    );
                    self.last_hash = snapshot.content_hash().ok();
                    return Some(snapshot);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        target: "syncstore::persistence",
                        backend = backend.name(), error = %e, "Backend read failed"
                    );
                    diagnostics.emit(Diagnostic::PersistenceFailure {
                        backend: backend.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryBackend;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct FailingBackend;

    impl PersistenceBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(SyncError::PersistenceFailure("quota exceeded".into()))
        }

        fn set(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
            Err(SyncError::PersistenceFailure("quota exceeded".into()))
        }
    }

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            persistable: vec!["session".into(), "prefs:*".into()],
            ..Default::default()
        }
    }

    fn snapshot(value: i64) -> Snapshot {
        let mut namespaces = BTreeMap::new();
        namespaces.insert("session".to_string(), json!({"n": value}));
        Snapshot::new(namespaces, Timestamp(value))
    }

    #[test]
    fn test_persistable_patterns() {
        let adapter = PersistenceAdapter::new(config(), vec![]);
        assert!(adapter.is_persistable("session"));
        assert!(adapter.is_persistable("prefs:theme"));
        assert!(!adapter.is_persistable("board:ticket-42"));
    }

    #[test]
    fn test_debounce_trailing_with_cap() {
        let mut adapter = PersistenceAdapter::new(config(), vec![]);
        let ms = Timestamp::from_millis;

        adapter.mark_dirty(ms(0));
        assert!(!adapter.take_due(ms(200)));
        adapter.mark_dirty(ms(200));
        assert!(!adapter.take_due(ms(300)));
        assert!(adapter.take_due(ms(450)));
        assert!(!adapter.is_dirty());

        // Constant activity is still flushed at the cap
        for t in (1_000..2_100).step_by(100) {
            adapter.mark_dirty(ms(t));
        }
        assert!(adapter.take_due(ms(2_100)));
    }

    #[test]
    fn test_fallback_to_second_backend() {
        let memory = Arc::new(MemoryBackend::new());
        let mut adapter = PersistenceAdapter::new(
            config(),
            vec![Arc::new(FailingBackend), memory.clone()],
        );
        let diagnostics = DiagnosticsManager::new();
        let handle = diagnostics.subscribe_all();

        assert!(adapter.save(snapshot(1), &diagnostics).unwrap());
        assert_eq!(memory.write_count(), 1);
        assert!(!adapter.is_degraded());
        assert!(matches!(
            handle.try_recv(),
            Ok(Diagnostic::PersistenceFailure { .. })
        ));
    }

    #[test]
    fn test_degrades_when_all_fail() {
        let mut adapter = PersistenceAdapter::new(config(), vec![Arc::new(FailingBackend)]);
        let diagnostics = DiagnosticsManager::new();

        assert!(matches!(
            adapter.save(snapshot(1), &diagnostics),
            Err(SyncError::PersistenceFailure(_))
        ));
        assert!(adapter.is_degraded());

        // Memory-only from now on
        assert!(!adapter.save(snapshot(2), &diagnostics).unwrap());
        assert_eq!(adapter.last_snapshot(), Some(&snapshot(2)));
    }

    #[test]
    fn test_identical_snapshot_not_rewritten() {
        let memory = Arc::new(MemoryBackend::new());
        let mut adapter = PersistenceAdapter::new(config(), vec![memory.clone()]);
        let diagnostics = DiagnosticsManager::new();

        assert!(adapter.save(snapshot(1), &diagnostics).unwrap());
        let mut same = snapshot(1);
        same.saved_at = Timestamp(500);
        assert!(!adapter.save(same, &diagnostics).unwrap());
        assert_eq!(memory.write_count(), 1);
    }

    #[test]
    fn test_load_filters_namespaces() {
        let memory = Arc::new(MemoryBackend::new());
        let mut snap = snapshot(7);
        snap.namespaces.insert("board:x".into(), json!(1));
        memory.set("syncstore", &codec::encode(&snap).unwrap()).unwrap();

        let mut adapter = PersistenceAdapter::new(config(), vec![Arc::new(FailingBackend), memory]);
        let loaded = adapter.load(&DiagnosticsManager::new()).unwrap();
        assert_eq!(loaded.namespaces.len(), 1);
        assert_eq!(loaded.namespaces["session"], json!({"n": 7}));
    }
}
