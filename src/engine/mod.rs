//! Processing engine: poll, claim, handle, commit.

pub mod agent;
pub mod handler;

pub use agent::{Agent, RunSummary};
pub use handler::{AcknowledgeHandler, MessageHandler};
