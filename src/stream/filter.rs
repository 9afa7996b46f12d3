//! Allow-lists for inbound envelopes.

use serde::{Deserialize, Serialize};

use crate::types::{EventEnvelope, NamespacePattern};

/// Which envelopes the applier turns into mutations.
///
/// Empty lists allow everything. Envelopes outside `namespaces` are ignored
/// before sequencing. Envelopes with an event type outside `event_types`
/// still advance their namespace's watermark, so they never hold a gap open.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvelopeFilter {
    pub event_types: Vec<String>,
    pub namespaces: Vec<NamespacePattern>,
}

impl EnvelopeFilter {
    pub fn accepts_namespace(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|p| p.matches(namespace))
    }

    pub fn accepts_event_type(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }

    pub fn accepts(&self, envelope: &EventEnvelope) -> bool {
        self.accepts_namespace(&envelope.namespace) && self.accepts_event_type(&envelope.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = EnvelopeFilter::default();
        assert!(filter.accepts(&EventEnvelope::new("any", "x.updated", json!({}), 1)));
    }

    #[test]
    fn test_allow_lists() {
        let filter = EnvelopeFilter {
            event_types: vec!["ticket.updated".into()],
            namespaces: vec!["board:*".into()],
        };
        assert!(filter.accepts(&EventEnvelope::new("board:1", "ticket.updated", json!({}), 1)));
        assert!(!filter.accepts(&EventEnvelope::new("board:1", "ticket.deleted", json!({}), 1)));
        assert!(!filter.accepts(&EventEnvelope::new("session", "ticket.updated", json!({}), 1)));
    }
}
