//! Realtime frame classification

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound liveness probe.
pub const PING_FRAME: &str = "ping";
/// Plain-text probe reply some servers send back.
const PONG_FRAME: &str = "pong";
/// Reserved inbound type, discarded.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// Typed inbound message: `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    #[cfg(test)]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// The envelope as a JSON value (what wildcard subscribers receive).
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "type": self.kind, "data": self.data })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Server keepalive or probe reply; nothing to dispatch.
    Heartbeat,
    Event(Envelope),
}

/// Classify a text frame. Errors are malformed frames.
pub fn classify(text: &str) -> Result<Inbound, serde_json::Error> {
    if text.trim() == PONG_FRAME {
        return Ok(Inbound::Heartbeat);
    }
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.kind == HEARTBEAT_TYPE {
        return Ok(Inbound::Heartbeat);
    }
    Ok(Inbound::Event(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame() {
        let inbound = classify(r#"{"type":"offer:expired","data":{"id":"42"}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Event(Envelope::new(
                "offer:expired",
                serde_json::json!({ "id": "42" })
            ))
        );
    }

    #[test]
    fn test_heartbeat_frames() {
        assert_eq!(
            classify(r#"{"type":"heartbeat","data":{"timestamp":1.5}}"#).unwrap(),
            Inbound::Heartbeat
        );
        assert_eq!(classify(r#"{"type":"heartbeat"}"#).unwrap(), Inbound::Heartbeat);
        assert_eq!(classify("pong").unwrap(), Inbound::Heartbeat);
    }

    #[test]
    fn test_missing_data_is_null() {
        match classify(r#"{"type":"trade:created"}"#).unwrap() {
            Inbound::Event(env) => assert_eq!(env.data, Value::Null),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(classify("not json").is_err());
        assert!(classify(r#"{"data":{}}"#).is_err());
        assert!(classify(r#"{"type":7}"#).is_err());
        assert!(classify("[1,2]").is_err());
    }
}
