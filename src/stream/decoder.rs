//! Envelope payload decoding.

use crate::error::{Result, SyncError};
use crate::types::{EventEnvelope, Patch};
use serde_json::Value;

/// Turns an envelope payload into a patch for its namespace.
pub trait EnvelopeDecoder: Send + Sync {
    fn decode(&self, envelope: &EventEnvelope) -> Result<Patch>;
}

/// Decodes by event-type suffix:
///
/// - `*.replaced`, `*.snapshot`: replace the value with the payload
/// - `*.deleted`: replace with `null`
/// - `*.appended`: append the payload to an array
/// - `*.patched`: the payload is a serialized [`Patch`]
/// - anything else: merge object payloads, replace with other payloads
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDecoder;

impl EnvelopeDecoder for DefaultDecoder {
    fn decode(&self, envelope: &EventEnvelope) -> Result<Patch> {
        let kind = envelope
            .event_type
            .rsplit('.')
            .next()
            .unwrap_or(envelope.event_type.as_str());

        let patch = match kind {
            "replaced" | "snapshot" => Patch::Replace(envelope.payload.clone()),
            "deleted" => Patch::Replace(Value::Null),
            "appended" => Patch::Append(envelope.payload.clone()),
            "patched" => serde_json::from_value(envelope.payload.clone()).map_err(|e| {
                SyncError::malformed(&envelope.namespace, format!("bad patch payload: {}", e))
            })?,
            _ => Patch::merge(envelope.payload.clone()),
        };
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(event_type: &str, payload: Value) -> Result<Patch> {
        DefaultDecoder.decode(&EventEnvelope::new("ns", event_type, payload, 1))
    }

    #[test]
    fn test_suffix_rules() {
        assert_eq!(
            decode("ticket.replaced", json!({"a": 1})).unwrap(),
            Patch::Replace(json!({"a": 1}))
        );
        assert_eq!(decode("ticket.deleted", json!({})).unwrap(), Patch::Replace(Value::Null));
        assert_eq!(decode("log.appended", json!("line")).unwrap(), Patch::Append(json!("line")));
        assert_eq!(
            decode("ticket.updated", json!({"status": "done"})).unwrap(),
            Patch::merge(json!({"status": "done"}))
        );
        assert_eq!(decode("counter", json!(5)).unwrap(), Patch::Replace(json!(5)));
    }

    #[test]
    fn test_patched_payload() {
        let payload = serde_json::to_value(Patch::Remove("draft".into())).unwrap();
        assert_eq!(decode("ticket.patched", payload).unwrap(), Patch::Remove("draft".into()));

        let err = decode("ticket.patched", json!({"nonsense": true})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMutation { .. }));
    }
}
