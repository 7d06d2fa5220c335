//! Core domain types shared across the engine.

mod ids;
mod message;

pub use ids::{MessageId, QueueName, ReceiptHandle};
pub use message::Message;
