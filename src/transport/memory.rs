//! In-process mailbox transport.
//!
//! Holds messages and their marker bits behind one lock, so claim-on-list is
//! atomic across any number of engines sharing the same `Arc`. Messages sent
//! to the mailbox's own address are delivered back into it, which is how
//! agents sharing one account talk to each other.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::state::{MarkerState, ProcessingState};
use super::Transport;
use crate::error::TransportError;
use crate::message::Message;

struct Entry {
    message: Message,
    markers: MarkerState,
}

#[derive(Default)]
struct Mailbox {
    /// Arrival order.
    entries: Vec<Entry>,
    sent: Vec<Message>,
}

impl Mailbox {
    fn entry_mut(&mut self, message_id: &str) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.message.message_id == message_id)
    }
}

/// Mailbox transport backed by process memory.
pub struct InMemoryTransport {
    address: String,
    mailbox: Mutex<Mailbox>,
}

impl InMemoryTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            mailbox: Mutex::new(Mailbox::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Mailbox>, TransportError> {
        self.mailbox
            .lock()
            .map_err(|_| TransportError::Unavailable("mailbox lock poisoned".into()))
    }

    /// Put a message into the mailbox as unread and unclaimed.
    ///
    /// Returns the id it is stored under.
    pub fn deliver(&self, message: Message) -> Result<String, TransportError> {
        let mut mailbox = self.lock()?;
        let id = message.message_id.clone();
        mailbox.entries.push(Entry {
            message,
            markers: MarkerState::PENDING,
        });
        Ok(id)
    }

    /// Current marker bits of a stored message.
    pub fn markers(&self, message_id: &str) -> Option<MarkerState> {
        let mut mailbox = self.lock().ok()?;
        mailbox.entry_mut(message_id).map(|e| e.markers)
    }

    pub fn state(&self, message_id: &str) -> Option<ProcessingState> {
        self.markers(message_id).map(ProcessingState::from)
    }

    /// Every message successfully sent through this transport, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.lock().map(|m| m.sent.clone()).unwrap_or_default()
    }

    /// Number of stored messages in a given state.
    pub fn count(&self, state: ProcessingState) -> usize {
        self.lock()
            .map(|m| {
                m.entries
                    .iter()
                    .filter(|e| e.markers.state() == state)
                    .count()
            })
            .unwrap_or(0)
    }

    fn transition(
        &self,
        message_id: &str,
        target: ProcessingState,
    ) -> Result<bool, TransportError> {
        let mut mailbox = self.lock()?;
        let Some(entry) = mailbox.entry_mut(message_id) else {
            debug!(message_id, "No such message in mailbox");
            return Ok(false);
        };

        let current = entry.markers.state();
        if current.is_terminal() {
            debug!(message_id, to = %target, "Message already done");
            return Ok(false);
        }
        if !current.can_transition_to(target) {
            debug!(message_id, from = %current, to = %target, "Refusing marker transition");
            return Ok(false);
        }

        entry.markers = target.markers();
        Ok(true)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn list_claimable(&self, limit: usize) -> Result<Vec<Message>, TransportError> {
        let mut mailbox = self.lock()?;
        let claimed: Vec<Message> = mailbox
            .entries
            .iter_mut()
            .filter(|e| e.markers.state().is_claimable())
            .take(limit)
            .map(|e| {
                e.markers = MarkerState::CLAIMED;
                e.message.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn send(&self, mut message: Message) -> Result<Message, TransportError> {
        if message.recipient.trim().is_empty() {
            return Err(TransportError::InvalidAddress {
                address: message.recipient,
                reason: "recipient is empty".into(),
            });
        }
        if message.sender.is_empty() {
            message.sender = self.address.clone();
        }

        let id = format!("mem-{}", Uuid::new_v4());
        let mut mailbox = self.lock()?;
        if message.thread_id.is_none() {
            message.thread_id = Some(id.clone());
        }
        message.message_id = id;

        mailbox.sent.push(message.clone());
        if message.recipient.eq_ignore_ascii_case(&self.address) {
            mailbox.entries.push(Entry {
                message: message.clone(),
                markers: MarkerState::PENDING,
            });
        }

        debug!(message_id = %message.message_id, recipient = %message.recipient, "Message sent");
        Ok(message)
    }

    async fn mark_succeeded(&self, message_id: &str) -> Result<bool, TransportError> {
        self.transition(message_id, ProcessingState::Done)
    }

    async fn mark_failed(&self, message_id: &str) -> Result<bool, TransportError> {
        self.transition(message_id, ProcessingState::Pending)
    }

    async fn fetch(&self, message_id: &str) -> Result<Option<Message>, TransportError> {
        let mut mailbox = self.lock()?;
        Ok(mailbox.entry_mut(message_id).map(|e| e.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbound(id: &str) -> Message {
        Message::new("peer@example.com", "agent@example.com", "corr", json!({"i": id}))
            .unwrap()
            .with_message_id(id)
    }

    #[tokio::test]
    async fn list_claims_only_pending_up_to_limit() {
        let transport = InMemoryTransport::new("agent@example.com");
        for id in ["m1", "m2", "m3"] {
            transport.deliver(inbound(id)).unwrap();
        }

        let first = transport.list_claimable(2).await.unwrap();
        assert_eq!(
            first.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        assert_eq!(transport.state("m1"), Some(ProcessingState::Claimed));
        assert_eq!(transport.state("m3"), Some(ProcessingState::Pending));

        let second = transport.list_claimable(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, "m3");
        assert!(transport.list_claimable(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_message_is_listed_again() {
        let transport = InMemoryTransport::new("agent@example.com");
        transport.deliver(inbound("m1")).unwrap();

        transport.list_claimable(10).await.unwrap();
        assert!(transport.mark_failed("m1").await.unwrap());
        assert_eq!(transport.markers("m1"), Some(MarkerState::PENDING));

        let again = transport.list_claimable(10).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn done_is_terminal() {
        let transport = InMemoryTransport::new("agent@example.com");
        transport.deliver(inbound("m1")).unwrap();
        transport.list_claimable(10).await.unwrap();

        assert!(transport.mark_succeeded("m1").await.unwrap());
        assert_eq!(transport.markers("m1"), Some(MarkerState::DONE));

        // A stray failure commit must not resurrect the message.
        assert!(!transport.mark_failed("m1").await.unwrap());
        assert!(!transport.mark_succeeded("m1").await.unwrap());
        assert_eq!(transport.markers("m1"), Some(MarkerState::DONE));
        assert!(transport.list_claimable(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_message_marks_return_false() {
        let transport = InMemoryTransport::new("agent@example.com");
        assert!(!transport.mark_succeeded("missing").await.unwrap());
        assert!(!transport.mark_failed("missing").await.unwrap());
        assert!(transport.fetch("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_assigns_identity_and_default_sender() {
        let transport = InMemoryTransport::new("agent@example.com");
        let outgoing = Message::new("", "peer@example.com", "corr", json!({})).unwrap();
        let local_id = outgoing.message_id.clone();

        let sent = transport.send(outgoing).await.unwrap();
        assert_eq!(sent.sender, "agent@example.com");
        assert_ne!(sent.message_id, local_id);
        assert_eq!(sent.thread_id.as_deref(), Some(sent.message_id.as_str()));
        assert_eq!(transport.sent(), vec![sent.clone()]);
        // Not addressed to this mailbox, so nothing arrives.
        assert_eq!(transport.count(ProcessingState::Pending), 0);
    }

    #[tokio::test]
    async fn send_keeps_existing_thread() {
        let transport = InMemoryTransport::new("agent@example.com");
        let outgoing = Message::new("a", "b", "s", json!({}))
            .unwrap()
            .with_thread_id(Some("t-1".into()));
        let sent = transport.send(outgoing).await.unwrap();
        assert_eq!(sent.thread_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn send_to_own_address_delivers() {
        let transport = InMemoryTransport::new("agent@example.com");
        let sent = transport
            .send(Message::new("other@example.com", "Agent@Example.com", "c", json!({})).unwrap())
            .await
            .unwrap();

        assert_eq!(transport.state(&sent.message_id), Some(ProcessingState::Pending));
        let fetched = transport.fetch(&sent.message_id).await.unwrap().unwrap();
        assert_eq!(fetched, sent);
    }

    #[tokio::test]
    async fn send_rejects_empty_recipient() {
        let transport = InMemoryTransport::new("agent@example.com");
        let err = transport
            .send(Message::new("a", " ", "s", json!({})).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
        assert!(transport.sent().is_empty());
    }
}
