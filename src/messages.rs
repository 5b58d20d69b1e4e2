use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consts::PROTOCOL_VERSION;

/// Versioned wrapper around every signaling frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub version: String,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Parses an inbound text frame. Anything that is not a JSON envelope
    /// with a string `type` yields `None`.
    pub fn parse(frame: &str) -> Option<Envelope> {
        serde_json::from_str(frame).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_frames_carry_the_protocol_version() {
        let envelope = Envelope::new("listen", json!({"token": "t"}));
        let frame = serde_json::to_string(&envelope).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "listen");
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["payload"]["token"], "t");
    }

    #[test]
    fn parse_splits_type_and_payload() {
        let envelope =
            Envelope::parse(r#"{"type":"answer","payload":{"callid":"CA1"},"version":"1.6"}"#)
                .unwrap();
        assert_eq!(envelope.kind, "answer");
        assert_eq!(envelope.payload["callid"], "CA1");
    }

    #[test]
    fn parse_tolerates_missing_payload_and_version() {
        let envelope = Envelope::parse(r#"{"type":"ringing"}"#).unwrap();
        assert_eq!(envelope.kind, "ringing");
        assert!(envelope.payload.is_null());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Envelope::parse("not json").is_none());
        assert!(Envelope::parse("42").is_none());
        assert!(Envelope::parse(r#"{"payload":{}}"#).is_none());
    }
}
