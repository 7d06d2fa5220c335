//! The message type that flows through the pipeline.
//!
//! The engine treats the payload as opaque bytes-in-a-string. The only field
//! it ever inspects is [`Message::nack`], which a handler sets to request
//! redelivery instead of acknowledgment. Everything else (the body, the
//! attribute map, the delivery metadata) is carried through the pipeline
//! unchanged so that handlers and queue clients can attach whatever they need
//! (for example a visibility-extension hint) without the engine knowing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ReceiptHandle};

/// A single message dequeued from the remote queue.
///
/// Instances are produced by a [`QueueClient`](crate::client::QueueClient)
/// on dequeue and travel through the message buffer, a handler, and the done
/// channel before being acknowledged. The handler may mutate the message
/// (most commonly via [`Message::mark_nack`]) before completing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Queue-assigned identifier, stable across redeliveries.
    pub id: MessageId,

    /// Receipt handle for this delivery attempt. Required by ack/nack;
    /// superseded when the message is redelivered.
    pub receipt: ReceiptHandle,

    /// The opaque payload. The engine never parses it.
    pub body: String,

    /// Set by a handler to request redelivery instead of acknowledgment.
    ///
    /// `false` (the default) means "ack on completion"; `true` means "nack,
    /// return to the queue".
    #[serde(default)]
    pub nack: bool,

    /// Free-form attributes attached by the queue client or the handler.
    /// Preserved end-to-end; the engine never inspects them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// How many times this message has been delivered, including this
    /// delivery. Stamped by the queue client.
    #[serde(default)]
    pub receive_count: u32,

    /// When the message was first delivered, if the client tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_received: Option<DateTime<Utc>>,
}

impl Message {
    /// Creates a message with the given identifiers and payload.
    ///
    /// Delivery metadata starts zeroed; queue clients stamp `receive_count`
    /// and `first_received` when they deliver.
    pub fn new(id: MessageId, receipt: ReceiptHandle, body: impl Into<String>) -> Self {
        Message {
            id,
            receipt,
            body: body.into(),
            nack: false,
            attributes: BTreeMap::new(),
            receive_count: 0,
            first_received: None,
        }
    }

    /// Marks this message for redelivery.
    ///
    /// A handler calls this before completing to route the message to
    /// `Nack` instead of `Ack`.
    pub fn mark_nack(&mut self) {
        self.nack = true;
    }

    /// Attaches an attribute, returning the message for chaining.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::new(MessageId::new("m-1"), ReceiptHandle::new("r-1"), "payload")
    }

    #[test]
    fn new_message_defaults_to_ack() {
        assert!(!message().nack);
    }

    #[test]
    fn mark_nack_sets_the_flag() {
        let mut msg = message();
        msg.mark_nack();
        assert!(msg.nack);
    }

    #[test]
    fn attributes_survive_serde() {
        let msg = message().with_attribute("visibility-extension", "60");

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(back, msg);
        assert_eq!(
            back.attributes.get("visibility-extension").map(String::as_str),
            Some("60")
        );
    }

    #[test]
    fn nack_flag_is_optional_in_serialized_form() {
        // Payloads produced before the nack field existed still deserialize.
        let json = r#"{"id":"m-1","receipt":"r-1","body":"x"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(!msg.nack);
        assert_eq!(msg.receive_count, 0);
    }
}
