//! Bounded undo/redo history.
//!
//! Entries live in a ring-like arena (`VecDeque`) with a cursor. Everything
//! before the cursor is applied; everything from the cursor on can be redone.
//! Recording after an undo discards the redo side. When full, the oldest
//! entry is evicted from the front in O(1).

use crate::types::{MutationDescriptor, Timestamp};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// One recorded commit.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub mutation: Arc<MutationDescriptor>,
    /// Namespace value before the commit.
    pub preceding: Arc<Value>,
    /// Namespace value after the commit.
    pub resulting: Arc<Value>,
    pub applied_at: Timestamp,
}

/// A namespace value to re-issue through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct HistorySnapshot {
    pub namespace: String,
    pub value: Arc<Value>,
}

/// Linear history with a cursor.
#[derive(Debug)]
pub struct HistoryTracker {
    entries: VecDeque<HistoryEntry>,
    cursor: usize,
    limit: usize,
}

impl HistoryTracker {
    /// A limit of zero disables recording.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            cursor: 0,
            limit,
        }
    }

    pub fn record(
        &mut self,
        mutation: Arc<MutationDescriptor>,
        preceding: Arc<Value>,
        resulting: Arc<Value>,
        applied_at: Timestamp,
    ) {
        if self.limit == 0 {
            return;
        }

        // Branching discards the redo side
        self.entries.truncate(self.cursor);

        self.entries.push_back(HistoryEntry {
            mutation,
            preceding,
            resulting,
            applied_at,
        });
        self.cursor += 1;

        while self.entries.len() > self.limit {
            self.entries.pop_front();
            self.cursor -= 1;
        }
    }

    /// Step back one entry, returning the value to restore.
    pub fn undo(&mut self) -> Option<HistorySnapshot> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        let entry = &self.entries[self.cursor];
        Some(HistorySnapshot {
            namespace: entry.mutation.namespace().to_string(),
            value: Arc::clone(&entry.preceding),
        })
    }

    /// Step forward one entry, returning the value to restore.
    pub fn redo(&mut self) -> Option<HistorySnapshot> {
        let entry = self.entries.get(self.cursor)?;
        let snapshot = HistorySnapshot {
            namespace: entry.mutation.namespace().to_string(),
            value: Arc::clone(&entry.resulting),
        };
        self.cursor += 1;
        Some(snapshot)
    }

    /// Move the cursor to `position` (0 = before the oldest entry).
    ///
    /// Returns the snapshots to apply, in order. Out-of-range positions
    /// are clamped.
    pub fn jump(&mut self, position: usize) -> Vec<HistorySnapshot> {
        let target = position.min(self.entries.len());
        let mut out = Vec::new();

        while self.cursor > target {
            if let Some(s) = self.undo() {
                out.push(s);
            }
        }
        while self.cursor < target {
            if let Some(s) = self.redo() {
                out.push(s);
            }
        }
        out
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Patch;
    use serde_json::json;

    fn record(tracker: &mut HistoryTracker, ns: &str, before: Value, after: Value) {
        let mutation = Arc::new(MutationDescriptor::local(
            ns,
            Patch::Replace(after.clone()),
            Timestamp(0),
        ));
        tracker.record(mutation, Arc::new(before), Arc::new(after), Timestamp(0));
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut h = HistoryTracker::new(10);
        record(&mut h, "a", json!(0), json!(1));
        record(&mut h, "a", json!(1), json!(2));

        let undone = h.undo().unwrap();
        assert_eq!(*undone.value, json!(1));

        let redone = h.redo().unwrap();
        assert_eq!(*redone.value, json!(2));
        assert!(h.redo().is_none());
    }

    #[test]
    fn test_record_after_undo_discards_redo() {
        let mut h = HistoryTracker::new(10);
        record(&mut h, "a", json!(0), json!(1));
        record(&mut h, "a", json!(1), json!(2));
        h.undo();

        record(&mut h, "a", json!(1), json!(9));
        assert_eq!(h.len(), 2);
        assert!(h.redo().is_none());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut h = HistoryTracker::new(3);
        for i in 0..5 {
            record(&mut h, "a", json!(i), json!(i + 1));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.cursor(), 3);

        // Oldest surviving entry is 2 -> 3
        assert_eq!(*h.entries().next().unwrap().preceding, json!(2));
        h.undo();
        h.undo();
        assert_eq!(*h.undo().unwrap().value, json!(2));
        assert!(h.undo().is_none());
    }

    #[test]
    fn test_jump() {
        let mut h = HistoryTracker::new(10);
        for i in 0..4 {
            record(&mut h, "a", json!(i), json!(i + 1));
        }

        let steps = h.jump(1);
        assert_eq!(steps.len(), 3);
        assert_eq!(*steps.last().unwrap().value, json!(1));
        assert_eq!(h.cursor(), 1);

        let steps = h.jump(100);
        assert_eq!(steps.len(), 3);
        assert_eq!(*steps.last().unwrap().value, json!(4));
    }

    #[test]
    fn test_zero_limit_disables() {
        let mut h = HistoryTracker::new(0);
        record(&mut h, "a", json!(0), json!(1));
        assert!(h.is_empty());
        assert!(h.undo().is_none());
    }

    #[test]
    fn test_reset() {
        let mut h = HistoryTracker::new(10);
        record(&mut h, "a", json!(0), json!(1));
        h.reset();
        assert!(!h.can_undo());
        assert!(!h.can_redo());
    }
}
