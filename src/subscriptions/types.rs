//! Subscription types for namespace observers.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle returned by `subscribe`; pass its id to `unsubscribe`.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub namespace: String,
}

/// Divergence between a local optimistic value and a resolved cache value
/// that a `manual` binding refused to settle on its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub cache_key: String,
    pub local: Value,
    pub remote: Value,
    pub detected_at: Timestamp,
}

/// What selectors observe for one namespace.
#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceView {
    pub value: Arc<Value>,
    pub conflict: Option<Arc<Conflict>>,
    /// Bumped on every effective commit to this namespace.
    pub version: u64,
}

impl NamespaceView {
    pub fn empty() -> Self {
        Self {
            value: Arc::new(Value::Null),
            conflict: None,
            version: 0,
        }
    }

    pub fn has_conflict(&self) -> bool {
        self.conflict.is_some()
    }
}
