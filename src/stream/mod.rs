//! Event-stream application.
//!
//! The transport is assumed to deliver at-least-once and possibly out of
//! order. For each namespace the applier keeps the last applied sequence
//! number:
//!
//! - `seq == last + 1` applies immediately and drains any buffered successors
//! - `seq > last + 1` is buffered behind the gap
//! - `seq <= last` is discarded
//!
//! An unseeded namespace starts at 0 unless the first sequence seen is
//! adopted as its baseline. The gap buffer is bounded: past its size the
//! oldest buffered envelopes are evicted and a resync is requested. A gap
//! that stays open too long requests a resync too.

mod applier;
mod decoder;
mod filter;
mod gap;

pub use applier::{EnvelopeOutcome, ResyncRequest, StreamApplier, StreamConfig};
pub use decoder::{DefaultDecoder, EnvelopeDecoder};
pub use filter::EnvelopeFilter;
pub use gap::GapBuffer;

/// Receives full-state resync requests for namespaces whose gap could not close.
pub trait ResyncHandler: Send + Sync {
    fn request_resync(&self, namespace: &str, last_applied: Option<u64>);
}
