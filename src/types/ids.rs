//! Newtype wrappers for queue-assigned identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds (e.g.
//! using a MessageId where a ReceiptHandle is expected) and make the code more
//! self-documenting. All of them are opaque strings assigned by the queue
//! service; the engine never interprets their contents.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix appended to a queue name to derive its default dead-letter queue.
const DEAD_LETTER_SUFFIX: &str = "-failed";

/// A queue-assigned message identifier.
///
/// Stable across redeliveries of the same message; used to correlate a
/// delivery with its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Self {
        MessageId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A receipt handle identifying one specific delivery attempt.
///
/// Unlike [`MessageId`], a receipt handle is minted fresh on every delivery;
/// acknowledging with a handle from a superseded delivery attempt is rejected
/// by the queue service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn new(s: impl Into<String>) -> Self {
        ReceiptHandle(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a queue hosted by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(pub String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        QueueName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the default dead-letter queue name for this queue.
    ///
    /// Messages that exceed their redelivery budget are redirected to
    /// `<name>-failed` unless the caller configures a different target.
    pub fn dead_letter(&self) -> QueueName {
        QueueName(format!("{}{}", self.0, DEAD_LETTER_SUFFIX))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
