//! Diagnostic event types.

use crate::types::Origin;
use serde::{Deserialize, Serialize};

/// Configuration for a diagnostics subscription.
#[derive(Clone, Debug)]
pub struct DiagnosticsConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 256
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: DiagnosticFilter,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            filter: DiagnosticFilter::all(),
        }
    }
}

/// Broad grouping of diagnostics, used for filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticCategory {
    Transport,
    Persistence,
    Reconciliation,
    Mutation,
    Lifecycle,
}

/// Filter criteria for diagnostics subscriptions.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticFilter {
    /// Only events about these namespaces (None = all). Events without a
    /// namespace always pass.
    pub namespaces: Option<Vec<String>>,

    pub include_transport: bool,
    pub include_persistence: bool,
    pub include_reconciliation: bool,
    pub include_mutations: bool,
}

impl DiagnosticFilter {
    /// Everything.
    pub fn all() -> Self {
        Self {
            namespaces: None,
            include_transport: true,
            include_persistence: true,
            include_reconciliation: true,
            include_mutations: true,
        }
    }

    /// Event-stream gaps and resync requests.
    pub fn transport() -> Self {
        Self {
            include_transport: true,
            ..Default::default()
        }
    }

    /// Backend failures and degraded mode.
    pub fn persistence() -> Self {
        Self {
            include_persistence: true,
            ..Default::default()
        }
    }

    /// Conflicts, stale optimistic updates and cache read failures.
    pub fn reconciliation() -> Self {
        Self {
            include_reconciliation: true,
            ..Default::default()
        }
    }

    pub(crate) fn accepts(&self, event: &Diagnostic) -> bool {
        let category_ok = match event.category() {
            DiagnosticCategory::Transport => self.include_transport,
            DiagnosticCategory::Persistence => self.include_persistence,
            DiagnosticCategory::Reconciliation => self.include_reconciliation,
            DiagnosticCategory::Mutation => self.include_mutations,
            DiagnosticCategory::Lifecycle => true,
        };
        if !category_ok {
            return false;
        }

        match (&self.namespaces, event.namespace()) {
            (Some(names), Some(ns)) => names.iter().any(|n| n == ns),
            _ => true,
        }
    }
}

/// Why a resynchronization was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    /// Too many envelopes waiting behind a gap.
    BufferFull,
    /// The oldest gap has been open too long.
    GapTooOld,
    /// Requested by the application.
    Manual,
}

/// Non-fatal events emitted by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    // --- Transport ---
    /// An envelope arrived ahead of the next expected sequence.
    TransportGap {
        namespace: String,
        last_applied: Option<u64>,
        received: u64,
        buffered: usize,
    },

    /// A full-state resync was requested from the external source.
    ResyncRequested {
        namespace: String,
        last_applied: Option<u64>,
        reason: ResyncReason,
    },

    // --- Persistence ---
    /// One backend failed; the next one is tried.
    PersistenceFailure { backend: String, error: String },

    /// Every backend failed; the session continues in memory only.
    PersistenceDegraded { error: String },

    // --- Reconciliation ---
    /// A manual binding detected divergent local and remote values.
    ReconciliationConflict { namespace: String, cache_key: String },

    /// An optimistic update has waited too long for confirmation.
    StaleOptimistic {
        namespace: String,
        correlation_id: String,
        age_ms: u64,
    },

    /// A cache read returned an error.
    CacheReadFailed { cache_key: String, error: String },

    // --- Mutations ---
    /// A mutation failed validation and never reached the store.
    MutationRejected {
        namespace: String,
        origin: Origin,
        reason: String,
    },

    // --- Lifecycle ---
    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl Diagnostic {
    pub fn category(&self) -> DiagnosticCategory {
        match self {
            Diagnostic::TransportGap { .. } | Diagnostic::ResyncRequested { .. } => {
                DiagnosticCategory::Transport
            }
            Diagnostic::PersistenceFailure { .. } | Diagnostic::PersistenceDegraded { .. } => {
                DiagnosticCategory::Persistence
            }
            Diagnostic::ReconciliationConflict { .. }
            | Diagnostic::StaleOptimistic { .. }
            | Diagnostic::CacheReadFailed { .. } => DiagnosticCategory::Reconciliation,
            Diagnostic::MutationRejected { .. } => DiagnosticCategory::Mutation,
            Diagnostic::Dropped { .. } => DiagnosticCategory::Lifecycle,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Diagnostic::TransportGap { namespace, .. }
            | Diagnostic::ResyncRequested { namespace, .. }
            | Diagnostic::ReconciliationConflict { namespace, .. }
            | Diagnostic::StaleOptimistic { namespace, .. }
            | Diagnostic::MutationRejected { namespace, .. } => Some(namespace),
            _ => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a diagnostics subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiagnosticsId(pub u64);

/// Handle to receive diagnostics.
pub struct DiagnosticsHandle {
    pub id: DiagnosticsId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<Diagnostic>,
}

impl DiagnosticsHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Diagnostic, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Diagnostic, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Diagnostic, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.receiver.try_iter().collect()
    }
}
