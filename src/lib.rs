//! # Sync Store
//!
//! A reactive state container that stays consistent with a remote event
//! stream, a server-state cache and durable storage, with bounded undo/redo.
//!
//! ## Core Concepts
//!
//! - **Namespaces**: Independently subscribable regions of the state tree
//! - **Mutation pipeline**: Every change, local or remote, runs the same stages
//! - **Event stream**: Per-namespace sequencing with gap buffering and resync
//! - **Cache bindings**: Namespaces mirrored to and from server cache keys
//! - **Persistence**: Debounced snapshots with backend fallback
//! - **History**: Undo/redo/jump over committed changes
//!
//! ## Example
//!
//! ```ignore
//! use syncstore::{Engine, EngineConfig, EventEnvelope, Patch};
//!
//! let engine = Engine::create(EngineConfig::from_json(r#"{
//!     "persistableNamespaces": ["session"],
//!     "cacheBindings": [
//!         {"cacheKey": "tickets/42", "namespace": "board:ticket-42", "direction": "bidirectional"}
//!     ]
//! }"#)?)?;
//!
//! engine.subscribe("board:ticket-42", |v| v.value["status"].clone(), |status| {
//!     println!("status is now {}", status);
//! });
//!
//! engine.set_state("board:ticket-42", Patch::merge(json!({"status": "todo"})))?;
//! engine.on_envelope(EventEnvelope::new(
//!     "board:ticket-42",
//!     "ticket.updated",
//!     json!({"status": "in_progress"}),
//!     5,
//! ));
//! engine.undo();
//! ```

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod history;
pub mod persistence;
pub mod pipeline;
pub mod state;
pub mod stream;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use cache::{
    CacheBinding, CacheBridge, CacheRead, CacheSideEffect, Direction, NoopCache,
    ReconciliationRule, ServerCache, StaleOptimistic, WriteMode,
};
pub use config::EngineConfig;
pub use diagnostics::{
    Diagnostic, DiagnosticFilter, DiagnosticsConfig, DiagnosticsHandle, DiagnosticsManager,
    DropReason, ResyncReason,
};
pub use engine::{Batch, ConflictResolution, Engine, EngineBuilder, EnvelopeReceipt};
pub use error::{Result, SyncError};
pub use history::{HistoryEntry, HistorySnapshot, HistoryTracker};
pub use persistence::{
    FileBackend, MemoryBackend, PersistenceAdapter, PersistenceBackend, PersistenceConfig,
    Snapshot,
};
pub use pipeline::{Outcome, Pipeline, Stage, Validator};
pub use state::{apply_patch, StateStore};
pub use stream::{
    DefaultDecoder, EnvelopeDecoder, EnvelopeFilter, EnvelopeOutcome, ResyncHandler, StreamApplier,
    StreamConfig,
};
pub use subscriptions::{Conflict, NamespaceView, SubscriptionHandle, SubscriptionId};
pub use types::*;
