//! Diagnostics manager for broadcasting non-fatal engine events.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{Diagnostic, DiagnosticsConfig, DiagnosticsHandle, DiagnosticsId, DropReason};

/// Internal subscription state.
struct Subscription {
    config: DiagnosticsConfig,
    sender: Sender<Diagnostic>,
}

impl Subscription {
    /// Try to send an event. Returns false if buffer is full (subscriber will be dropped).
    fn try_send(&self, event: Diagnostic) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Manages diagnostics subscriptions and broadcasts events.
pub struct DiagnosticsManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<DiagnosticsId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Buffer size used by `subscribe_all`.
    default_buffer: usize,
}

impl DiagnosticsManager {
    /// Create a new diagnostics manager.
    pub fn new() -> Self {
        Self::with_default_buffer(DiagnosticsConfig::default().buffer_size)
    }

    pub fn with_default_buffer(default_buffer: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_buffer: default_buffer.max(1),
        }
    }

    /// Create a new subscription.
    pub fn subscribe(&self, config: DiagnosticsConfig) -> DiagnosticsHandle {
        let id = DiagnosticsId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        DiagnosticsHandle { id, receiver }
    }

    /// Subscribe to everything with the default buffer size.
    pub fn subscribe_all(&self) -> DiagnosticsHandle {
        self.subscribe(DiagnosticsConfig {
            buffer_size: self.default_buffer,
            ..Default::default()
        })
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: DiagnosticsId) {
        let mut subs = self.subscriptions.write();
        if let Some(sub) = subs.remove(&id) {
            // Send dropped event (best effort)
            let _ = sub.sender.try_send(Diagnostic::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Broadcast an event to matching subscriptions. Drops subscribers that
    /// fail to receive.
    pub fn emit(&self, event: Diagnostic) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if sub.config.filter.accepts(&event) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    // Try to notify about the drop (might fail, that's ok)
                    let _ = sub.sender.try_send(Diagnostic::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for DiagnosticsManager {
    fn default() -> Self {
        Self::new()
    }
}
