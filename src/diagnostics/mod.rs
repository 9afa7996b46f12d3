//! Observable stream of non-fatal engine events.
//!
//! Transport gaps and persistence failures never interrupt the pipeline;
//! they are logged and broadcast here instead. Subscriptions use bounded
//! buffers and slow subscribers are dropped.
//!
//! # Example
//!
//! ```ignore
//! let handle = engine.subscribe_diagnostics(DiagnosticsConfig {
//!     filter: DiagnosticFilter::persistence(),
//!     ..Default::default()
//! });
//!
//! for event in handle.drain() {
//!     eprintln!("{:?}", event);
//! }
//! ```

mod manager;
mod types;

pub use manager::DiagnosticsManager;
pub use types::{
    Diagnostic, DiagnosticCategory, DiagnosticFilter, DiagnosticsConfig, DiagnosticsHandle,
    DiagnosticsId, DropReason, ResyncReason,
};
