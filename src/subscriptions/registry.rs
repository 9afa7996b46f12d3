//! Selector subscription registry.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{NamespaceView, SubscriptionId};

type Listener = Box<dyn FnMut(&NamespaceView) + Send>;

/// Internal subscription state.
struct Subscriber {
    active: AtomicBool,
    listener: Mutex<Listener>,
}

/// Keeps selector subscriptions per namespace, in registration order.
pub struct SubscriptionRegistry {
    /// Ids grow monotonically, so BTreeMap order is registration order.
    by_namespace: RwLock<HashMap<String, BTreeMap<SubscriptionId, Arc<Subscriber>>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            by_namespace: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a selector subscription.
    ///
    /// The selector is evaluated immediately against `current` so that the
    /// first notification only happens once the derived value changes.
    pub fn subscribe<S, Sel, Cb>(
        &self,
        namespace: &str,
        current: &NamespaceView,
        selector: Sel,
        mut callback: Cb,
    ) -> SubscriptionId
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&NamespaceView) -> S + Send + 'static,
        Cb: FnMut(&S) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut last = selector(current);

        let listener: Listener = Box::new(move |view: &NamespaceView| {
            let derived = selector(view);
            if derived != last {
                callback(&derived);
                last = derived;
            }
        });

        let subscriber = Arc::new(Subscriber {
            active: AtomicBool::new(true),
            listener: Mutex::new(listener),
        });

        self.by_namespace
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(id, subscriber);

        id
    }

    /// Remove a subscription. Returns false if it was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.by_namespace.write();
        for entries in subs.values_mut() {
            if let Some(sub) = entries.remove(&id) {
                sub.active.store(false, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    /// Drop every subscription on a namespace.
    pub fn remove_namespace(&self, namespace: &str) -> usize {
        match self.by_namespace.write().remove(namespace) {
            Some(entries) => {
                for sub in entries.values() {
                    sub.active.store(false, Ordering::SeqCst);
                }
                entries.len()
            }
            None => 0,
        }
    }

    /// Notify the namespace's subscribers of a committed view.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe while being notified.
    pub fn notify(&self, namespace: &str, view: &NamespaceView) {
        let targets: Vec<Arc<Subscriber>> = match self.by_namespace.read().get(namespace) {
            Some(entries) => entries.values().cloned().collect(),
            None => return,
        };

        for sub in targets {
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            let mut listener = sub.listener.lock();
            (*listener)(view);
        }
    }

    /// Get subscription count across all namespaces.
    pub fn subscription_count(&self) -> usize {
        self.by_namespace.read().values().map(BTreeMap::len).sum()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
