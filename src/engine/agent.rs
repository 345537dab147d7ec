//! The agent poll loop.
//!
//! Each cycle claims up to `max_messages` messages, runs the handler on them
//! one at a time and commits the outcome back to the transport as marker
//! changes. The transport's claim is the only coordination between agents
//! sharing a mailbox.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::handler::{AcknowledgeHandler, MessageHandler};
use crate::config::AgentConfig;
use crate::error::{MessageError, Result, TransportError};
use crate::message::Message;
use crate::transport::{ProcessingState, Transport};

/// Base delay before retrying a failed marker commit.
const MARK_BACKOFF_MS: u64 = 200;

/// Totals for one `run` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Poll cycles completed.
    pub iterations: u64,
    /// Messages handled successfully across all cycles.
    pub processed: usize,
    /// Whether the loop ended because of a shutdown request.
    pub interrupted: bool,
}

/// A mailbox agent: one sequential poll loop over an injected transport.
pub struct Agent {
    address: String,
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let address = if config.agent_email.trim().is_empty() {
            transport.address().to_string()
        } else {
            config.agent_email.clone()
        };
        Self {
            address,
            config,
            transport,
            handler,
        }
    }

    /// An agent that acknowledges every message it receives.
    pub fn with_default_handler(config: AgentConfig, transport: Arc<dyn Transport>) -> Self {
        let address = if config.agent_email.trim().is_empty() {
            transport.address().to_string()
        } else {
            config.agent_email.clone()
        };
        let handler = Arc::new(AcknowledgeHandler::new(address, Arc::clone(&transport)));
        Self::new(config, transport, handler)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Verify the transport before the first poll.
    pub async fn prepare(&self) -> std::result::Result<(), TransportError> {
        self.transport.prepare().await
    }

    /// Send a new message from this agent.
    pub async fn send_message(
        &self,
        to: &str,
        subject: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Message> {
        let message = Message::new(self.address.as_str(), to, subject, payload)?;
        let sent = self.transport.send(message).await?;
        info!(
            message_id = %sent.message_id,
            recipient = %sent.recipient,
            subject = %sent.subject,
            "Message sent"
        );
        Ok(sent)
    }

    /// Reply to `original`, linking the reply into its thread.
    pub async fn reply_to(&self, original: &Message, payload: impl Serialize) -> Result<Message> {
        let reply = original.create_reply(payload)?;
        Ok(self.transport.send(reply).await?)
    }

    /// Start a conversation from raw JSON.
    ///
    /// The JSON is decoded before the transport is touched. The subject is
    /// the payload's `message_id` when present, otherwise the current Unix
    /// timestamp.
    pub async fn initiate(&self, to: &str, raw_json: &str) -> Result<Message> {
        let payload: Value = serde_json::from_str(raw_json).map_err(MessageError::Decode)?;
        let subject = match payload.get("message_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => Utc::now().timestamp().to_string(),
        };
        self.send_message(to, subject, payload).await
    }

    /// Claim one batch and process it.
    ///
    /// Returns the number of messages whose handler succeeded. Only listing
    /// errors are returned; per-message failures are committed and logged.
    pub async fn process_one_cycle(&self) -> std::result::Result<usize, TransportError> {
        let messages = self
            .transport
            .list_claimable(self.config.max_messages)
            .await?;
        if messages.is_empty() {
            debug!(transport = self.transport.name(), "No new messages");
            return Ok(0);
        }

        info!("Processing {} message(s)", messages.len());
        let mut processed = 0;
        for message in &messages {
            if self.process_message(message).await {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Run the handler on one claimed message and commit the outcome.
    async fn process_message(&self, message: &Message) -> bool {
        debug!(message_id = %message.message_id, sender = %message.sender, "Handling message");

        let outcome = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(failure_report(&e)),
            Err(panic) => Some(format!("handler panicked: {}", panic_message(&*panic))),
        };

        match failure {
            None => {
                self.commit(&message.message_id, ProcessingState::Done).await;
                true
            }
            Some(reason) => {
                error!(
                    message_id = %message.message_id,
                    sender = %message.sender,
                    "Failed to process message: {reason}"
                );
                self.commit(&message.message_id, ProcessingState::Pending)
                    .await;
                false
            }
        }
    }

    /// Move a claimed message to `target`, retrying transport errors.
    ///
    /// A commit that keeps failing leaves the message claimed.
    async fn commit(&self, message_id: &str, target: ProcessingState) {
        let mut attempt = 0;
        loop {
            let result = match target {
                ProcessingState::Done => self.transport.mark_succeeded(message_id).await,
                _ => self.transport.mark_failed(message_id).await,
            };
            match result {
                Ok(true) => return,
                Ok(false) => {
                    warn!(message_id, state = %target, "Transport did not apply marker update");
                    return;
                }
                Err(e) if attempt < self.config.mark_retries => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    warn!(
                        message_id,
                        attempt,
                        "Marker update failed, retrying in {}ms: {e}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(message_id, state = %target, "Giving up on marker update: {e}");
                    return;
                }
            }
        }
    }

    /// Poll until `max_iterations` cycles have run or Ctrl-C is pressed.
    pub async fn run(&self, max_iterations: Option<u64>) -> RunSummary {
        self.run_until(max_iterations, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Poll until `max_iterations` cycles have run or `shutdown` resolves.
    ///
    /// A shutdown during a cycle lets that cycle finish its commits; during
    /// the sleep between cycles it stops at once.
    pub async fn run_until<F>(&self, max_iterations: Option<u64>, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        if max_iterations == Some(0) {
            return summary;
        }

        tokio::pin!(shutdown);
        info!(
            agent = %self.address,
            transport = self.transport.name(),
            interval_secs = self.config.check_interval.as_secs(),
            max_messages = self.config.max_messages,
            "Agent started"
        );

        loop {
            let cycle = self.process_one_cycle();
            tokio::pin!(cycle);

            let mut stopping = false;
            let result = loop {
                tokio::select! {
                    result = &mut cycle => break result,
                    () = &mut shutdown, if !stopping => {
                        info!("Shutdown requested, finishing current cycle");
                        stopping = true;
                    }
                }
            };

            summary.iterations += 1;
            match result {
                Ok(count) => summary.processed += count,
                Err(e) => error!("Poll failed: {e}"),
            }

            if stopping {
                summary.interrupted = true;
                break;
            }
            if max_iterations.is_some_and(|max| summary.iterations >= max) {
                break;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.check_interval) => {}
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    summary.interrupted = true;
                    break;
                }
            }
        }

        info!(
            iterations = summary.iterations,
            processed = summary.processed,
            interrupted = summary.interrupted,
            "Agent stopped"
        );
        summary
    }
}

/// Jittered exponential delay for the given retry attempt (starting at 1).
fn backoff(attempt: u32) -> Duration {
    let base = MARK_BACKOFF_MS << attempt.saturating_sub(1).min(5);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Full error chain, plus the backtrace when one was captured.
fn failure_report(err: &anyhow::Error) -> String {
    format!("{err:?}")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
