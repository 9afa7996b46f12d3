//! Per-namespace sequencing of inbound envelopes.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::decoder::{DefaultDecoder, EnvelopeDecoder};
use super::filter::EnvelopeFilter;
use super::gap::GapBuffer;
use crate::diagnostics::ResyncReason;
use crate::error::SyncError;
use crate::types::{EventEnvelope, MutationDescriptor, Patch, Timestamp};

/// Bounds for gap buffering.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Envelopes held behind one gap before a resync is requested.
    /// Default: 256
    pub max_buffered_envelopes: usize,

    /// How long a gap may stay open before a resync is requested.
    /// Default: 5s
    pub max_gap_age: Duration,

    /// Take the first envelope seen for an unseeded namespace as its
    /// baseline. When false, unseeded namespaces start at sequence 0 and
    /// expect 1 next.
    /// Default: false
    pub adopt_first_sequence: bool,

    pub filter: EnvelopeFilter,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffered_envelopes: 256,
            max_gap_age: Duration::from_secs(5),
            adopt_first_sequence: false,
            filter: EnvelopeFilter::default(),
        }
    }
}

/// Result of feeding one envelope to the applier.
#[derive(Debug)]
pub enum EnvelopeOutcome {
    /// The envelope (and any buffered successors it unblocked) became mutations.
    Applied {
        mutations: Vec<MutationDescriptor>,
        /// Envelopes that were in sequence but could not be decoded.
        rejected: Vec<SyncError>,
    },
    /// Held until the gap before it closes.
    Buffered {
        last_applied: Option<u64>,
        buffered: usize,
        /// Set when this envelope pushed the buffer past its bounds.
        resync: Option<ResyncReason>,
    },
    /// At or below the watermark; discarded.
    Duplicate,
    /// Outside the namespace allow-list; ignored without sequencing.
    Filtered,
}

/// A namespace whose gap needs a full resync.
#[derive(Clone, Debug, PartialEq)]
pub struct ResyncRequest {
    pub namespace: String,
    pub last_applied: Option<u64>,
    pub reason: ResyncReason,
}

#[derive(Debug)]
struct NamespaceStream {
    last_applied: Option<u64>,
    gap: GapBuffer,
    resync_pending: bool,
}

/// Restores per-namespace ordering over an at-least-once, reordering transport.
pub struct StreamApplier {
    config: StreamConfig,
    decoder: Arc<dyn EnvelopeDecoder>,
    streams: HashMap<String, NamespaceStream>,
}

impl StreamApplier {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_decoder(config, Arc::new(DefaultDecoder))
    }

    pub fn with_decoder(config: StreamConfig, decoder: Arc<dyn EnvelopeDecoder>) -> Self {
        Self {
            config,
            decoder,
            streams: HashMap::new(),
        }
    }

    fn stream_mut(&mut self, namespace: &str) -> &mut NamespaceStream {
        let config = &self.config;
        self.streams
            .entry(namespace.to_string())
            .or_insert_with(|| NamespaceStream {
                last_applied: None,
                gap: GapBuffer::new(config.max_buffered_envelopes, config.max_gap_age),
                resync_pending: false,
            })
    }

    /// Last applied sequence for a namespace.
    pub fn last_applied(&self, namespace: &str) -> Option<u64> {
        self.streams.get(namespace).and_then(|s| s.last_applied)
    }

    /// Envelopes currently held behind a gap.
    pub fn buffered(&self, namespace: &str) -> usize {
        self.streams.get(namespace).map(|s| s.gap.len()).unwrap_or(0)
    }

    pub fn resync_pending(&self, namespace: &str) -> bool {
        self.streams.get(namespace).map(|s| s.resync_pending).unwrap_or(false)
    }

    /// Set the watermark without applying anything (e.g. after loading
    /// server state out of band).
    pub fn seed_watermark(&mut self, namespace: &str, sequence: u64) {
        let stream = self.stream_mut(namespace);
        stream.last_applied = Some(sequence);
        stream.gap.discard_through(sequence);
    }

    /// Forget everything about a namespace.
    pub fn forget(&mut self, namespace: &str) {
        self.streams.remove(namespace);
    }

    /// Feed one envelope.
    pub fn on_envelope(&mut self, envelope: EventEnvelope, now: Timestamp) -> EnvelopeOutcome {
        let namespace = envelope.namespace.clone();
        if !self.config.filter.accepts_namespace(&namespace) {
            debug!(
                target: "syncstore::stream",
                namespace = %namespace, "Ignoring envelope outside namespace filter"
            );
            return EnvelopeOutcome::Filtered;
        }

        let seq = envelope.sequence_number;
        let adopt_first = self.config.adopt_first_sequence;
        let last_applied = self.stream_mut(&namespace).last_applied;
        let watermark = match last_applied {
            Some(last) => Some(last),
            None if adopt_first => None,
            None => Some(0),
        };

        match watermark {
            Some(last) if seq <= last => {
                debug!(
                    target: "syncstore::stream",
                    namespace = %namespace, seq, last, "Discarding stale envelope"
                );
                EnvelopeOutcome::Duplicate
            }
            Some(last) if seq - last > 1 => {
                let stream = self.stream_mut(&namespace);
                stream.gap.insert(envelope, now);
                let buffered = stream.gap.len();

                let resync = match stream.gap.overflow(now) {
                    Some(reason) if !stream.resync_pending => {
                        stream.resync_pending = true;
                        warn!(
                            target: "syncstore::stream",
                            namespace = %namespace, ?reason, buffered,
                            "Gap buffer exceeded, requesting resync"
                        );
                        Some(reason)
                    }
                    _ => None,
                };

                debug!(
                    target: "syncstore::stream",
                    namespace = %namespace, seq, ?last_applied, buffered, "Buffered envelope behind gap"
                );
                EnvelopeOutcome::Buffered {
                    last_applied,
                    buffered,
                    resync,
                }
            }
            // Contiguous, or first envelope adopted as baseline
            _ => {
                let mut mutations = Vec::new();
                let mut rejected = Vec::new();
                self.apply_and_drain(envelope, now, &mut mutations, &mut rejected);
                EnvelopeOutcome::Applied {
                    mutations,
                    rejected,
                }
            }
        }
    }

    fn apply_and_drain(
        &mut self,
        first: EventEnvelope,
        now: Timestamp,
        mutations: &mut Vec<MutationDescriptor>,
        rejected: &mut Vec<SyncError>,
    ) {
        let namespace = first.namespace.clone();
        let mut next = Some(first);

        while let Some(envelope) = next.take() {
            if !self.config.filter.accepts_event_type(&envelope.event_type) {
                debug!(
                    target: "syncstore::stream",
                    namespace = %namespace, seq = envelope.sequence_number,
                    event_type = %envelope.event_type, "Skipping filtered event type"
                );
            } else {
                match self.decoder.decode(&envelope) {
                    Ok(patch) => mutations.push(MutationDescriptor::stream(
                        &namespace,
                        patch,
                        Timestamp::from(envelope.server_timestamp),
                        envelope.sequence_number,
                        envelope.correlation_id.clone(),
                    )),
                    Err(e) => {
                        warn!(
                            target: "syncstore::stream",
                            namespace = %namespace, seq = envelope.sequence_number, error = %e,
                            "Skipping undecodable envelope"
                        );
                        rejected.push(e);
                    }
                }
            }

            let stream = self.stream_mut(&namespace);
            stream.last_applied = Some(envelope.sequence_number);
            // u64::MAX is terminal: nothing can follow it
            next = match envelope.sequence_number.checked_add(1) {
                Some(expected) => stream.gap.pop_next(expected, now),
                None => None,
            };
        }

        let stream = self.stream_mut(&namespace);
        if let Some(last) = stream.last_applied {
            stream.gap.discard_through(last);
        }
        if stream.gap.is_empty() && !stream.gap.has_evicted() {
            stream.resync_pending = false;
        }
    }

    /// Check every open gap against its age bound.
    pub fn poll(&mut self, now: Timestamp) -> Vec<ResyncRequest> {
        let mut requests = Vec::new();
        for (namespace, stream) in self.streams.iter_mut() {
            if stream.resync_pending {
                continue;
            }
            if let Some(reason) = stream.gap.overflow(now) {
                stream.resync_pending = true;
                warn!(
                    target: "syncstore::stream",
                    namespace = %namespace, ?reason, "Gap open too long, requesting resync"
                );
                requests.push(ResyncRequest {
                    namespace: namespace.clone(),
                    last_applied: stream.last_applied,
                    reason,
                });
            }
        }
        requests.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        requests
    }

    /// Mark a namespace as waiting for a resync requested elsewhere.
    pub fn mark_resync_pending(&mut self, namespace: &str) -> Option<u64> {
        let stream = self.stream_mut(namespace);
        stream.resync_pending = true;
        stream.last_applied
    }

    /// Install an authoritative snapshot at `sequence`.
    ///
    /// Returns the replacing mutation followed by any buffered envelopes
    /// that are contiguous with the new watermark.
    pub fn resync_complete(
        &mut self,
        namespace: &str,
        value: Value,
        sequence: u64,
        now: Timestamp,
    ) -> EnvelopeOutcome {
        let stream = self.stream_mut(namespace);
        stream.last_applied = Some(sequence);
        // Evictions past `sequence` are requested again on the next poll
        stream.resync_pending = false;
        let dropped = stream.gap.discard_through(sequence);
        let next = match sequence.checked_add(1) {
            Some(expected) => stream.gap.pop_next(expected, now),
            None => None,
        };

        debug!(
            target: "syncstore::stream",
            namespace = %namespace, sequence, dropped, "Resync installed"
        );

        let mut mutations = vec![MutationDescriptor::stream(
            namespace,
            Patch::Replace(value),
            now,
            sequence,
            None,
        )];
        let mut rejected = Vec::new();
        if let Some(envelope) = next {
            self.apply_and_drain(envelope, now, &mut mutations, &mut rejected);
        }
        EnvelopeOutcome::Applied {
            mutations,
            rejected,
        }
    }
}
