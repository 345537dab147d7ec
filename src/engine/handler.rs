//! Message handlers: what the engine does with each claimed message.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::error::MessageError;
use crate::message::{Envelope, Exchange, Message};
use crate::transport::Transport;

/// Per-message processing step plugged into the engine.
///
/// Returning an error (or panicking) marks the message failed; it becomes
/// eligible again on the next poll. Handlers must be safe to run more than
/// once for the same message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Default handler: replies to the sender with the inbound exchange log plus
/// an acknowledgement entry.
pub struct AcknowledgeHandler {
    agent_address: String,
    transport: Arc<dyn Transport>,
}

impl AcknowledgeHandler {
    pub fn new(agent_address: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            agent_address: agent_address.into(),
            transport,
        }
    }

    /// The acknowledgement reply for `inbound`, not yet sent.
    pub fn build_reply(&self, inbound: &Message) -> Result<Message, MessageError> {
        let mut envelope = Envelope::reply_to(inbound);
        envelope.push(Exchange::acknowledgement(&self.agent_address, inbound));
        inbound.create_reply(&envelope)
    }
}

#[async_trait]
impl MessageHandler for AcknowledgeHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        if message.payload.is_undecodable() {
            info!(message_id = %message.message_id, "Payload is not JSON; acknowledging anyway");
        }

        let reply = self
            .build_reply(message)
            .context("failed to build acknowledgement")?;
        let sent = self
            .transport
            .send(reply)
            .await
            .with_context(|| format!("failed to send acknowledgement to {}", message.sender))?;

        info!(
            message_id = %message.message_id,
            reply_id = %sent.message_id,
            recipient = %sent.recipient,
            "Acknowledged message"
        );
        Ok(())
    }
}
