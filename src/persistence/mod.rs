//! Durable snapshots of selected namespaces.
//!
//! Commits to persistable namespaces mark the adapter dirty; the snapshot is
//! written once the trailing debounce window passes (`Engine::tick`) or on
//! `Engine::flush_persistence`. Backends are tried in order and the first
//! success wins. When all of them fail the session continues in memory.

mod adapter;
mod backend;
mod codec;

pub use adapter::{PersistenceAdapter, PersistenceConfig};
pub use backend::{FileBackend, MemoryBackend, PersistenceBackend};
pub use codec::{decode, encode, Snapshot};
