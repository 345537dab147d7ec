//! The `Message` entity and its JSON payload.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MessageError;

/// Key used to mark a payload the transport could not decode.
pub const UNDECODABLE_KEY: &str = "$undecodable";

/// Message payload: any JSON value, or an explicit marker for a body that
/// was not valid JSON.
///
/// Undecodable bodies are still delivered to the handler so it can decide
/// what to do with them. On the wire the marker is
/// `{"$undecodable": {"raw": ..., "reason": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Payload {
    Json(Value),
    Undecodable { raw: String, reason: String },
}

impl Payload {
    /// Decode a raw body. Never fails: invalid JSON becomes `Undecodable`.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::Json(value),
            Err(e) => Self::Undecodable {
                raw: raw.to_string(),
                reason: e.to_string(),
            },
        }
    }

    /// The JSON value, if the payload was decodable.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Undecodable { .. } => None,
        }
    }

    pub fn is_undecodable(&self) -> bool {
        matches!(self, Self::Undecodable { .. })
    }

    /// Look up a top-level key of an object payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_json().and_then(|v| v.get(key))
    }

    /// Render the payload as an email body (pretty JSON).
    pub fn to_body(&self) -> String {
        match self {
            Self::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            Self::Undecodable { raw, .. } => raw.clone(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Json(Value::Object(serde_json::Map::new()))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        if let Some(marker) = value.get(UNDECODABLE_KEY)
            && value.as_object().is_some_and(|o| o.len() == 1)
        {
            let field = |name: &str| {
                marker
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            return Self::Undecodable {
                raw: field("raw"),
                reason: field("reason"),
            };
        }
        Self::Json(value)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Json(value) => value,
            Payload::Undecodable { raw, reason } => serde_json::json!({
                UNDECODABLE_KEY: { "raw": raw, "reason": reason }
            }),
        }
    }
}

/// A message exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id until sent, then the transport's authoritative id.
    #[serde(default = "new_message_id")]
    pub message_id: String,
    /// Conversation grouping; opaque to the engine.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    /// Correlation key rather than free text.
    #[serde(default)]
    pub subject: String,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    /// Ancestor message ids, oldest first. Never contains duplicates.
    #[serde(default, deserialize_with = "deserialize_references")]
    pub references: Vec<String>,
    #[serde(default)]
    pub payload: Payload,
}

impl Message {
    /// Build a new outgoing message with a fresh correlation id.
    ///
    /// Fails only if `payload` cannot be represented as JSON.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self, MessageError> {
        let payload = serde_json::to_value(payload).map_err(MessageError::Encode)?;
        Ok(Self {
            message_id: new_message_id(),
            thread_id: None,
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            date: Utc::now(),
            references: Vec::new(),
            payload: Payload::Json(payload),
        })
    }

    /// Build a reply: addresses swapped, subject set to this message's id,
    /// thread inherited and this message appended to the reference chain.
    pub fn create_reply(&self, reply_payload: impl Serialize) -> Result<Self, MessageError> {
        let mut references = self.references.clone();
        if !references.contains(&self.message_id) {
            references.push(self.message_id.clone());
        }

        let reply = Self::new(
            self.recipient.clone(),
            self.sender.clone(),
            self.message_id.clone(),
            reply_payload,
        )?;

        Ok(Self {
            thread_id: self.thread_id.clone(),
            references,
            ..reply
        })
    }

    /// A message is a reply iff it references at least one ancestor.
    pub fn is_reply(&self) -> bool {
        !self.references.is_empty()
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_thread_id(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// Replace the reference chain, dropping repeated ids.
    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = dedup_preserving_order(references);
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize every attribute to pretty JSON.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string_pretty(self).map_err(MessageError::Encode)
    }

    /// Parse a message previously produced by [`Message::to_json`].
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(MessageError::Decode)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message(id={}, subject='{}', sender='{}', recipient='{}')",
            self.message_id, self.subject, self.sender, self.recipient
        )
    }
}

/// Generate a local correlation id.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Drop repeated ids, keeping the first occurrence of each.
pub fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn deserialize_references<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(dedup_preserving_order(ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message::new("a@example.com", "b@example.com", "corr-1", json!({"n": 1}))
            .unwrap()
            .with_thread_id(Some("thread-9".into()))
            .with_references(vec!["root".into(), "mid".into()])
    }

    #[test]
    fn new_assigns_fresh_ids() {
        let m1 = Message::new("a", "b", "s", json!({})).unwrap();
        let m2 = Message::new("a", "b", "s", json!({})).unwrap();
        assert_ne!(m1.message_id, m2.message_id);
        assert!(!m1.is_reply());
        assert_eq!(m1.thread_id, None);
    }

    #[test]
    fn new_rejects_unserializable_payload() {
        use std::collections::HashMap;
        // Non-string map keys cannot become a JSON object.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let err = Message::new("a", "b", "s", bad).unwrap_err();
        assert!(matches!(err, MessageError::Encode(_)));
    }

    #[test]
    fn new_keeps_marker_shaped_payload_as_json() {
        let value = json!({UNDECODABLE_KEY: {"raw": "x", "reason": "y"}});
        let m = Message::new("a", "b", "s", &value).unwrap();
        assert_eq!(m.payload, Payload::Json(value));
    }

    #[test]
    fn reply_links_to_parent() {
        let original = sample();
        let reply = original.create_reply(json!({"ok": true})).unwrap();

        assert_eq!(reply.sender, "b@example.com");
        assert_eq!(reply.recipient, "a@example.com");
        assert_eq!(reply.subject, original.message_id);
        assert_eq!(reply.thread_id.as_deref(), Some("thread-9"));
        assert_eq!(
            reply.references,
            vec!["root".to_string(), "mid".to_string(), original.message_id.clone()]
        );
        assert!(reply.is_reply());
        assert_ne!(reply.message_id, original.message_id);
    }

    #[test]
    fn reply_does_not_duplicate_parent_reference() {
        let mut original = sample();
        original.references.push(original.message_id.clone());
        let reply = original.create_reply(json!({})).unwrap();
        assert_eq!(reply.references, original.references);
    }

    #[test]
    fn with_references_dedups() {
        let m = Message::new("a", "b", "s", json!({}))
            .unwrap()
            .with_references(vec!["x".into(), "y".into(), "x".into(), "z".into(), "y".into()]);
        assert_eq!(m.references, vec!["x", "y", "z"]);
    }

    #[test]
    fn json_roundtrip_keeps_all_attributes() {
        let original = sample();
        let parsed = Message::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn from_json_defaults_optional_fields() {
        let parsed = Message::from_json(r#"{"sender": "a@example.com"}"#).unwrap();
        assert_eq!(parsed.sender, "a@example.com");
        assert!(!parsed.message_id.is_empty());
        assert!(parsed.references.is_empty());
        assert_eq!(parsed.payload, Payload::default());
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        assert!(matches!(
            Message::from_json("{\"sender\": "),
            Err(MessageError::Decode(_))
        ));
        // Wrong type for a known field is an error, not a partial object.
        assert!(matches!(
            Message::from_json(r#"{"references": "not-a-list"}"#),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn from_json_dedups_references() {
        let parsed = Message::from_json(r#"{"references": ["a", "b", "a"]}"#).unwrap();
        assert_eq!(parsed.references, vec!["a", "b"]);
    }

    #[test]
    fn payload_decode_marks_invalid_json() {
        let payload = Payload::decode("hello, not json");
        assert!(payload.is_undecodable());
        assert_eq!(payload.as_json(), None);
        assert_eq!(payload.to_body(), "hello, not json");
    }

    #[test]
    fn undecodable_marker_survives_serialization() {
        let m = sample().with_payload(Payload::decode("{broken"));
        let parsed = Message::from_json(&m.to_json().unwrap()).unwrap();
        match parsed.payload {
            Payload::Undecodable { raw, reason } => {
                assert_eq!(raw, "{broken");
                assert!(!reason.is_empty());
            }
            other => panic!("expected undecodable payload, got {other:?}"),
        }
    }

    #[test]
    fn object_with_extra_keys_is_plain_json() {
        let value = json!({UNDECODABLE_KEY: {"raw": "x"}, "other": 1});
        assert!(matches!(Payload::from(value), Payload::Json(_)));
    }

    #[test]
    fn display_summarizes_message() {
        let m = Message::new("a", "b", "corr", json!({}))
            .unwrap()
            .with_message_id("id-1");
        assert_eq!(
            m.to_string(),
            "Message(id=id-1, subject='corr', sender='a', recipient='b')"
        );
    }
}
