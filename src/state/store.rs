//! The observable namespace store.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::subscriptions::{
    Conflict, NamespaceView, SubscriptionId, SubscriptionRegistry,
};

/// How a commit treats the namespace's conflict marker.
#[derive(Clone, Debug, PartialEq)]
pub enum ConflictUpdate {
    Keep,
    Set(Conflict),
    Clear,
}

/// Single source of truth: namespace -> value, plus per-namespace observers.
///
/// Values are held behind `Arc` so unchanged namespaces keep their identity
/// across commits to other namespaces.
pub struct StateStore {
    slots: RwLock<HashMap<String, NamespaceView>>,
    subscriptions: SubscriptionRegistry,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    /// Current value of a namespace.
    pub fn get(&self, namespace: &str) -> Option<Arc<Value>> {
        self.slots.read().get(namespace).map(|v| Arc::clone(&v.value))
    }

    /// Current view (value, conflict, version) of a namespace.
    pub fn view(&self, namespace: &str) -> Option<NamespaceView> {
        self.slots.read().get(namespace).cloned()
    }

    /// Current value, `null` for unknown namespaces.
    pub fn value_or_null(&self, namespace: &str) -> Arc<Value> {
        self.get(namespace).unwrap_or_else(|| Arc::new(Value::Null))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.slots.read().contains_key(namespace)
    }

    /// Sorted namespace names.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Add a namespace with an initial value. Returns false if it already existed.
    pub fn mount(&self, namespace: &str, initial: Value) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(namespace) {
            return false;
        }
        slots.insert(
            namespace.to_string(),
            NamespaceView {
                value: Arc::new(initial),
                conflict: None,
                version: 0,
            },
        );
        true
    }

    /// Remove a namespace together with its subscribers.
    pub fn unmount(&self, namespace: &str) -> Option<NamespaceView> {
        let removed = self.slots.write().remove(namespace);
        self.subscriptions.remove_namespace(namespace);
        removed
    }

    /// Write a namespace, creating it lazily.
    ///
    /// Returns the new view if anything observable changed. Subscribers are
    /// not notified here; the caller does that once the lock is released.
    pub fn commit(
        &self,
        namespace: &str,
        value: Arc<Value>,
        conflict: ConflictUpdate,
    ) -> Option<NamespaceView> {
        let mut slots = self.slots.write();
        let slot = slots
            .entry(namespace.to_string())
            .or_insert_with(NamespaceView::empty);

        let next_conflict = match conflict {
            ConflictUpdate::Keep => slot.conflict.clone(),
            ConflictUpdate::Set(c) => Some(Arc::new(c)),
            ConflictUpdate::Clear => None,
        };

        let value_changed = !Arc::ptr_eq(&slot.value, &value) && *slot.value != *value;
        let conflict_changed = slot.conflict != next_conflict;
        if !value_changed && !conflict_changed {
            return None;
        }

        if value_changed {
            slot.value = value;
        }
        slot.conflict = next_conflict;
        slot.version += 1;
        Some(slot.clone())
    }

    /// Notify subscribers of a committed view.
    pub fn notify(&self, namespace: &str, view: &NamespaceView) {
        self.subscriptions.notify(namespace, view);
    }

    pub fn subscribe<S, Sel, Cb>(&self, namespace: &str, selector: Sel, callback: Cb) -> SubscriptionId
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&NamespaceView) -> S + Send + 'static,
        Cb: FnMut(&S) + Send + 'static,
    {
        let current = self.view(namespace).unwrap_or_else(NamespaceView::empty);
        self.subscriptions.subscribe(namespace, &current, selector, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    /// Copy out the namespaces accepted by `filter`.
    pub fn snapshot<F>(&self, filter: F) -> BTreeMap<String, Value>
    where
        F: Fn(&str) -> bool,
    {
        self.slots
            .read()
            .iter()
            .filter(|(name, _)| filter(name))
            .map(|(name, view)| (name.clone(), (*view.value).clone()))
            .collect()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
