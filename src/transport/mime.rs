//! Email encoding for agent messages.
//!
//! Outbound: the payload becomes a pretty-printed JSON `text/plain` body, the
//! subject carries the correlation key, and replies get `In-Reply-To` /
//! `References` headers. Inbound: the same headers are read back with
//! mail-parser, and a body that is not JSON becomes [`Payload::Undecodable`].
//!
//! Message ids are stored without angle brackets and wrapped only on the wire.

use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use mail_parser::{HeaderValue, MessageParser};
use uuid::Uuid;

use crate::error::{MessageError, TransportError};
use crate::message::{Message, Payload};

/// Thread id derived from a reference chain: the conversation root, or the
/// message itself when it starts a conversation.
///
/// Replies inherit their parent's thread under this rule because their first
/// reference is the parent's root.
pub fn thread_root(references: &[String], message_id: &str) -> String {
    references
        .first()
        .cloned()
        .unwrap_or_else(|| message_id.to_string())
}

/// A new globally unique Message-ID for mail sent from `sender`.
pub fn new_email_id(sender: &str) -> String {
    let domain = sender
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>'))
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("{}@{}", Uuid::new_v4(), domain)
}

fn bracketed(id: &str) -> String {
    format!("<{id}>")
}

fn parse_mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Build the outbound email for `message`, using its current `message_id` as
/// the Message-ID header.
pub fn to_email(message: &Message) -> Result<lettre::Message, TransportError> {
    let mut builder = lettre::Message::builder()
        .from(parse_mailbox(&message.sender)?)
        .to(parse_mailbox(&message.recipient)?)
        .subject(message.subject.clone())
        .message_id(Some(bracketed(&message.message_id)))
        .date(SystemTime::from(message.date))
        .header(ContentType::TEXT_PLAIN);

    if let Some(parent) = message.references.last() {
        let chain = message
            .references
            .iter()
            .map(|id| bracketed(id))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.in_reply_to(bracketed(parent)).references(chain);
    }

    builder
        .body(message.payload.to_body())
        .map_err(|e| TransportError::SendFailed {
            recipient: message.recipient.clone(),
            reason: format!("Failed to build email: {e}"),
        })
}

/// Rebuild a received message from raw RFC 5322 bytes.
pub fn from_email(raw: &[u8]) -> Result<Message, MessageError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MessageError::MalformedEmail("unparseable message".into()))?;

    let message_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let references = match parsed.references() {
        HeaderValue::Text(id) => vec![id.to_string()],
        HeaderValue::TextList(ids) => ids.iter().map(|id| id.to_string()).collect(),
        _ => Vec::new(),
    };

    let body = parsed
        .body_text(0)
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    let date = parsed.date().and_then(to_utc).unwrap_or_else(Utc::now);

    let message = Message {
        message_id: message_id.clone(),
        thread_id: None,
        sender: extract_sender(&parsed),
        recipient: extract_addresses(parsed.to())
            .into_iter()
            .next()
            .unwrap_or_default(),
        subject: parsed.subject().unwrap_or_default().to_string(),
        date,
        references: Vec::new(),
        payload: Payload::decode(&body),
    }
    .with_references(references);

    let thread = thread_root(&message.references, &message_id);
    Ok(message.with_thread_id(Some(thread)))
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract email addresses from an optional mail_parser Address field.
fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Convert a header date, honouring its zone offset.
fn to_utc(d: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    let local = NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    let offset = TimeDelta::seconds(i64::from(d.tz_hour) * 3600 + i64::from(d.tz_minute) * 60);
    let utc = if d.tz_before_gmt {
        local + offset
    } else {
        local - offset
    };
    Some(utc.and_utc())
}
