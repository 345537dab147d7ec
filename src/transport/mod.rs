//! Mailbox transport abstraction.
//!
//! The engine depends only on this trait. A transport keeps two marker bits per
//! message (`unread`, `claimed`) and is the single source of truth for
//! processing state; see [`state`] for the state machine they encode.
//!
//! Every method is an independent remote call that may fail. Transports never
//! retry internally.

pub mod imap;
pub mod memory;
pub mod mime;
pub mod state;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::Message;

pub use imap::ImapTransport;
pub use memory::InMemoryTransport;
pub use state::{MarkerState, ProcessingState};

/// Capability set the processing engine needs from a mailbox.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Address of the mailbox this transport reads, used as the default sender.
    fn address(&self) -> &str;

    /// Verify the mailbox is usable. Called once at startup.
    async fn prepare(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Return up to `limit` messages that are unread and unclaimed, claiming
    /// each one atomically as part of the call.
    ///
    /// A message whose claim or fetch fails after selection is left out of the
    /// result and its claim is released.
    async fn list_claimable(&self, limit: usize) -> Result<Vec<Message>, TransportError>;

    /// Deliver a message and return it with its authoritative identity.
    ///
    /// Either fully succeeds or fails with nothing sent.
    async fn send(&self, message: Message) -> Result<Message, TransportError>;

    /// Transition to `unread=false, claimed=false`.
    ///
    /// Returns `false` if the message is unknown or the transition is refused.
    async fn mark_succeeded(&self, message_id: &str) -> Result<bool, TransportError>;

    /// Transition to `unread=true, claimed=false`, making the message eligible
    /// for the next poll.
    ///
    /// Returns `false` if the message is unknown or already done.
    async fn mark_failed(&self, message_id: &str) -> Result<bool, TransportError>;

    /// Retrieve full content for a message id.
    async fn fetch(&self, message_id: &str) -> Result<Option<Message>, TransportError>;
}
