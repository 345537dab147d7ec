//! Agent messages and the payload envelope convention.

pub mod envelope;
pub mod model;

pub use envelope::{Envelope, Exchange};
pub use model::{Message, Payload};
