//! Store core: namespace values, patch application and commit.
//!
//! Each namespace holds an independent JSON value. Commits replace the
//! namespace's `Arc` only when the value actually changed, so observers of
//! other namespaces never see spurious updates.

mod store;
mod operations;

pub use store::{ConflictUpdate, StateStore};
pub use operations::apply_patch;
