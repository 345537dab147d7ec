//! Mailqueue agent: message-passing agents over a shared mailbox.

pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod transport;
