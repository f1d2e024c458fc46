use crate::types::ConversationId;
use crate::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery state of a message.
///
/// `Pending -> Sent -> Confirmed`, with `Pending -> Failed` and `Sent -> Failed`.
/// `Confirmed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

impl DeliveryStatus {
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Sent, Confirmed) | (Pending, Failed) | (Sent, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Confirmed | DeliveryStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FailureReason {
    /// The retry budget ran out.
    #[serde(rename_all = "camelCase")]
    TransportFailure { attempts: u32, last_error: String },
    /// Published, but the network never confirmed it in time.
    ConfirmationTimeout,
    #[serde(rename_all = "camelCase")]
    ConfirmationFailed { error: String },
    /// The session the message was sent from was replaced or signed out.
    SessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender: Address,
    pub direction: Direction,
    pub content: String,
    /// Milliseconds since the UNIX epoch, as stamped by the sender.
    pub sent_at: u64,
    /// Insertion order within the conversation; breaks `sent_at` ties.
    pub seq: u64,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl Message {
    /// Two deliveries with the same key are the same message.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.sender, self.sent_at, &self.content)
    }

    pub fn order_key(&self) -> (u64, u64) {
        (self.sent_at, self.seq)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    sender: Address,
    sent_at: u64,
    content: String,
}

impl DedupKey {
    pub fn new(sender: &Address, sent_at: u64, content: &str) -> Self {
        Self {
            sender: sender.clone(),
            sent_at,
            content: content.to_string(),
        }
    }
}
