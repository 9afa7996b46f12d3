//! Gap buffering for out-of-order envelopes.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::diagnostics::ResyncReason;
use crate::types::{EventEnvelope, Timestamp};

/// Envelopes waiting behind a sequence gap, keyed by sequence number.
///
/// Holds at most `max_envelopes`. Past that the lowest sequence is evicted:
/// the newest envelopes are the ones still useful after a resync.
#[derive(Clone, Debug)]
pub struct GapBuffer {
    buffered: BTreeMap<u64, EventEnvelope>,
    started_at: Option<Timestamp>,
    /// Highest sequence evicted since the watermark last passed it.
    evicted_through: Option<u64>,
    max_envelopes: usize,
    max_age: Duration,
}

impl GapBuffer {
    pub fn new(max_envelopes: usize, max_age: Duration) -> Self {
        Self {
            buffered: BTreeMap::new(),
            started_at: None,
            evicted_through: None,
            max_envelopes,
            max_age,
        }
    }

    /// Buffer an envelope. Returns false if that sequence was already held.
    pub fn insert(&mut self, envelope: EventEnvelope, now: Timestamp) -> bool {
        if self.buffered.contains_key(&envelope.sequence_number) {
            return false;
        }
        if self.buffered.is_empty() {
            self.started_at = Some(now);
        }
        self.buffered.insert(envelope.sequence_number, envelope);

        while self.buffered.len() > self.max_envelopes {
            let Some((evicted, _)) = self.buffered.pop_first() else { break };
            self.evicted_through = Some(self.evicted_through.map_or(evicted, |e| e.max(evicted)));
        }
        true
    }

    /// Remove and return the envelope with sequence `expected`, if buffered
    /// and first in line.
    pub fn pop_next(&mut self, expected: u64, now: Timestamp) -> Option<EventEnvelope> {
        let first = *self.buffered.keys().next()?;
        if first != expected {
            return None;
        }
        let envelope = self.buffered.remove(&first);
        self.started_at = if self.buffered.is_empty() {
            None
        } else {
            Some(now)
        };
        envelope
    }

    /// Drop everything at or below `sequence`. Evictions at or below it no
    /// longer matter.
    pub fn discard_through(&mut self, sequence: u64) -> usize {
        let dropped = match sequence.checked_add(1) {
            Some(first_kept) => {
                let keep = self.buffered.split_off(&first_kept);
                std::mem::replace(&mut self.buffered, keep).len()
            }
            None => std::mem::take(&mut self.buffered).len(),
        };
        if self.buffered.is_empty() {
            self.started_at = None;
        }
        if self.evicted_through.is_some_and(|e| e <= sequence) {
            self.evicted_through = None;
        }
        dropped
    }

    /// Whether envelopes were evicted that the watermark has not passed.
    pub fn has_evicted(&self) -> bool {
        self.evicted_through.is_some()
    }

    /// Whether the buffer has outgrown its bounds.
    pub fn overflow(&self, now: Timestamp) -> Option<ResyncReason> {
        if self.evicted_through.is_some() {
            return Some(ResyncReason::BufferFull);
        }
        match self.started_at {
            Some(started) if now.since(started) > self.max_age => Some(ResyncReason::GapTooOld),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}
