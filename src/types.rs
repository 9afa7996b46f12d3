//! Core types for the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn from_millis(ms: i64) -> Self {
        Timestamp(ms * 1_000)
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_micros() as i64))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Source of time for debouncing, gap ageing and stale detection.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to. Cloned handles share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(start.0)),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.micros.fetch_add(d.as_micros() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, ts: Timestamp) {
        self.micros.store(ts.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.micros.load(Ordering::SeqCst))
    }
}

/// Correlates an optimistic local mutation with its later confirmation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Fresh random correlation id.
    pub fn generate() -> Self {
        CorrelationId(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId(s.to_string())
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Corr({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-unique identifier of a mutation descriptor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub u64);

static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(1);

impl MutationId {
    fn next() -> Self {
        MutationId(NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mut({})", self.0)
    }
}

/// Where a mutation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Direct call from the application (including undo/redo).
    Local,
    /// Server-state cache resolution.
    Cache,
    /// Inbound event stream.
    Stream,
    /// Another tab or process sharing this state.
    Peer,
}

impl Origin {
    /// Position within a tick: lower ranks apply first.
    pub fn rank(self) -> u8 {
        match self {
            Origin::Local => 0,
            Origin::Cache => 1,
            Origin::Stream | Origin::Peer => 2,
        }
    }
}

/// Why a descriptor exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Ordinary forward change.
    Forward,
    /// Re-issued history snapshot (undo/redo/jump).
    Replay,
    /// Rolls back a failed optimistic update.
    Compensation,
    /// Settles a manual reconciliation conflict.
    Resolution,
}

/// A change to apply to one namespace value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Patch {
    /// Replace the whole value.
    Replace(Value),
    /// Shallow-merge object fields into the value.
    Merge(Map<String, Value>),
    /// Apply a nested patch to one object field.
    Field { name: String, patch: Box<Patch> },
    /// Push onto an array value.
    Append(Value),
    /// Replace one array element.
    Edit { index: usize, value: Value },
    /// Remove an array range (clamped).
    Redact { start: usize, end: usize },
    /// Remove one object field.
    Remove(String),
}

impl Patch {
    /// Merge patch from a JSON object literal. Non-objects become a replace.
    pub fn merge(value: Value) -> Self {
        match value {
            Value::Object(map) => Patch::Merge(map),
            other => Patch::Replace(other),
        }
    }

    pub fn field(name: impl Into<String>, patch: Patch) -> Self {
        Patch::Field {
            name: name.into(),
            patch: Box::new(patch),
        }
    }

    /// Top-level object fields this patch touches, if it is field-scoped.
    pub fn touched_fields(&self) -> Option<Vec<String>> {
        match self {
            Patch::Merge(map) => Some(map.keys().cloned().collect()),
            Patch::Field { name, .. } => Some(vec![name.clone()]),
            Patch::Remove(name) => Some(vec![name.clone()]),
            _ => None,
        }
    }
}

/// An immutable record describing one proposed state change.
///
/// Stages never modify a descriptor; annotations travel alongside it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationDescriptor {
    id: MutationId,
    origin: Origin,
    namespace: String,
    patch: Patch,
    timestamp: Timestamp,
    correlation_id: CorrelationId,
    sequence: Option<u64>,
    kind: MutationKind,
}

impl MutationDescriptor {
    fn build(origin: Origin, namespace: &str, patch: Patch, timestamp: Timestamp) -> Self {
        Self {
            id: MutationId::next(),
            origin,
            namespace: namespace.to_string(),
            patch,
            timestamp,
            correlation_id: CorrelationId::generate(),
            sequence: None,
            kind: MutationKind::Forward,
        }
    }

    /// Local-origin mutation with a fresh correlation id.
    pub fn local(namespace: &str, patch: Patch, timestamp: Timestamp) -> Self {
        Self::build(Origin::Local, namespace, patch, timestamp)
    }

    /// Cache-origin mutation.
    pub fn cache(namespace: &str, patch: Patch, timestamp: Timestamp) -> Self {
        Self::build(Origin::Cache, namespace, patch, timestamp)
    }

    /// Stream-origin mutation carrying the envelope's sequence number.
    pub fn stream(
        namespace: &str,
        patch: Patch,
        timestamp: Timestamp,
        sequence: u64,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        let mut desc = Self::build(Origin::Stream, namespace, patch, timestamp);
        desc.sequence = Some(sequence);
        if let Some(corr) = correlation_id {
            desc.correlation_id = corr;
        }
        desc
    }

    /// Mutation from another tab or process.
    pub fn peer(namespace: &str, patch: Patch, timestamp: Timestamp, sequence: Option<u64>) -> Self {
        let mut desc = Self::build(Origin::Peer, namespace, patch, timestamp);
        desc.sequence = sequence;
        desc
    }

    pub(crate) fn replay(namespace: &str, value: Value, timestamp: Timestamp) -> Self {
        let mut desc = Self::build(Origin::Local, namespace, Patch::Replace(value), timestamp);
        desc.kind = MutationKind::Replay;
        desc
    }

    pub(crate) fn compensation(
        namespace: &str,
        value: Value,
        timestamp: Timestamp,
        correlation_id: CorrelationId,
    ) -> Self {
        let mut desc = Self::build(Origin::Local, namespace, Patch::Replace(value), timestamp);
        desc.kind = MutationKind::Compensation;
        desc.correlation_id = correlation_id;
        desc
    }

    pub(crate) fn resolution(namespace: &str, value: Value, timestamp: Timestamp) -> Self {
        let mut desc = Self::build(Origin::Local, namespace, Patch::Replace(value), timestamp);
        desc.kind = MutationKind::Resolution;
        desc
    }

    /// Use a caller-chosen correlation id (before the descriptor is issued).
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }
}

/// One inbound notification from the event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Topic the envelope is scoped to.
    pub namespace: String,
    pub event_type: String,
    pub payload: Value,
    pub server_timestamp: DateTime<Utc>,
    pub sequence_number: u64,
    /// Echo of the local correlation id when the event confirms an optimistic write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl EventEnvelope {
    pub fn new(
        namespace: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        sequence_number: u64,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            event_type: event_type.into(),
            payload,
            server_timestamp: Utc::now(),
            sequence_number,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Matches namespaces by exact name or by `prefix*`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespacePattern(pub String);

impl NamespacePattern {
    pub fn matches(&self, namespace: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => namespace.starts_with(prefix),
            None => self.0 == namespace,
        }
    }
}

impl From<&str> for NamespacePattern {
    fn from(s: &str) -> Self {
        NamespacePattern(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(NamespacePattern::from("board:*").matches("board:ticket-42"));
        assert!(!NamespacePattern::from("board:*").matches("session"));
        assert!(NamespacePattern::from("session").matches("session"));
        assert!(!NamespacePattern::from("session").matches("session:tmp"));
    }

    #[test]
    fn test_origin_rank() {
        assert!(Origin::Local.rank() < Origin::Cache.rank());
        assert!(Origin::Cache.rank() < Origin::Stream.rank());
        assert_eq!(Origin::Stream.rank(), Origin::Peer.rank());
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let other = clock.clone();
        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp::from_millis(1_250));
        assert_eq!(clock.now().since(Timestamp::from_millis(1_000)), Duration::from_millis(250));
    }

    #[test]
    fn test_descriptor_ids_unique() {
        let a = MutationDescriptor::local("a", Patch::Replace(Value::Null), Timestamp(0));
        let b = MutationDescriptor::local("a", Patch::Replace(Value::Null), Timestamp(0));
        assert_ne!(a.id(), b.id());
        assert_ne!(a.correlation_id(), b.correlation_id());
    }
}
