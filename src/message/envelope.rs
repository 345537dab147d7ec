//! The exchange-log envelope carried in agent payloads.
//!
//! ```json
//! { "message_id": "...", "exchanges": [ { "sender": "...", "timestamp": "...",
//!   "message_id": "...", "recipients": ["..."], "content": {} } ] }
//! ```
//!
//! `exchanges` is append-only: earlier entries are carried forward verbatim,
//! so they are kept as raw JSON rather than re-encoded through [`Exchange`].

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{Message, Payload};

/// One entry in an exchange log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub sender: String,
    /// ISO-8601, UTC.
    pub timestamp: String,
    pub message_id: String,
    pub recipients: Vec<String>,
    pub content: Value,
}

impl Exchange {
    /// Acknowledge `inbound` on behalf of `agent`.
    pub fn acknowledgement(agent: &str, inbound: &Message) -> Self {
        Self {
            sender: agent.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message_id: inbound.message_id.clone(),
            recipients: vec![inbound.sender.clone()],
            content: serde_json::json!({
                "action": "acknowledge",
                "message": format!("Your message was received by {agent}"),
                "expected_format": "json",
                "response_targets": [inbound.sender],
            }),
        }
    }
}

/// Payload envelope: a message id plus the exchange log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    #[serde(default)]
    pub exchanges: Vec<Value>,
}

impl Envelope {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            exchanges: Vec::new(),
        }
    }

    /// Start a reply envelope for `inbound`, carrying forward its exchanges.
    ///
    /// Only an object payload with an array `exchanges` contributes entries;
    /// anything else (including undecodable bodies) starts an empty log.
    pub fn reply_to(inbound: &Message) -> Self {
        let exchanges = Self::exchanges_of(&inbound.payload)
            .map(<[Value]>::to_vec)
            .unwrap_or_default();
        Self {
            message_id: inbound.message_id.clone(),
            exchanges,
        }
    }

    /// The exchange log in a payload, if it has one.
    pub fn exchanges_of(payload: &Payload) -> Option<&[Value]> {
        payload
            .get("exchanges")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
    }

    pub fn push(&mut self, exchange: Exchange) {
        // Exchange has only string/array/Value fields, so this cannot fail.
        if let Ok(value) = serde_json::to_value(exchange) {
            self.exchanges.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbound(payload: Value) -> Message {
        Message::new("alice@example.com", "bob@example.com", "corr", payload)
            .unwrap()
            .with_message_id("in-1")
    }

    #[test]
    fn reply_copies_prior_exchanges_verbatim() {
        let e1 = json!({"sender": "alice@example.com", "custom": [1, 2, 3]});
        let msg = inbound(json!({"message_id": "x", "exchanges": [e1.clone()]}));

        let mut envelope = Envelope::reply_to(&msg);
        envelope.push(Exchange::acknowledgement("bob@example.com", &msg));

        assert_eq!(envelope.message_id, "in-1");
        assert_eq!(envelope.exchanges.len(), 2);
        assert_eq!(envelope.exchanges[0], e1);
        assert_eq!(envelope.exchanges[1]["sender"], "bob@example.com");
        assert_eq!(envelope.exchanges[1]["message_id"], "in-1");
        assert_eq!(envelope.exchanges[1]["recipients"], json!(["alice@example.com"]));
    }

    #[test]
    fn reply_without_exchanges_starts_empty() {
        for payload in [json!({"hello": "world"}), json!([1, 2]), json!({"exchanges": "nope"})] {
            assert!(Envelope::reply_to(&inbound(payload)).exchanges.is_empty());
        }
        let undecodable = inbound(json!({})).with_payload(Payload::decode("not json"));
        assert!(Envelope::reply_to(&undecodable).exchanges.is_empty());
    }

    #[test]
    fn acknowledgement_content() {
        let msg = inbound(json!({}));
        let ack = Exchange::acknowledgement("bob@example.com", &msg);
        assert_eq!(ack.content["action"], "acknowledge");
        assert_eq!(
            ack.content["message"],
            "Your message was received by bob@example.com"
        );
        assert_eq!(ack.content["expected_format"], "json");
        assert_eq!(ack.content["response_targets"], json!(["alice@example.com"]));
        assert!(ack.timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ack.timestamp).is_ok());
    }

    #[test]
    fn envelope_wire_shape() {
        let mut envelope = Envelope::new("m-1");
        envelope.push(Exchange::acknowledgement("bob", &inbound(json!({}))));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["message_id"], "m-1");
        let entry = &value["exchanges"][0];
        for key in ["sender", "timestamp", "message_id", "recipients", "content"] {
            assert!(entry.get(key).is_some(), "missing {key}");
        }
    }
}
