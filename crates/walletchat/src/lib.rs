//! Wallet-authenticated sessions, conversations and message delivery for an
//! end-to-end encrypted messaging client.

pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod memory;
pub mod message;
pub mod messenger;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod test_utils;
pub mod types;

pub use config::{ClientConfig, RetryPolicy};
pub use conversation::{Conversation, Listener};
pub use error::{Error, Result};
pub use identity::{challenge_for, Identity, IdentityBinder, WalletSigner};
pub use memory::InMemoryNetwork;
pub use message::{DedupKey, DeliveryStatus, Direction, FailureReason, Message};
pub use messenger::{ConversationSnapshot, Messenger, SessionSnapshot, Snapshot};
pub use network::{Connection, Envelope, EnvelopeStream, HistoryPage, MessagingNetwork, Receipt};
pub use pipeline::{MessagePipeline, MessageStream, Subscription};
pub use registry::ConversationRegistry;
pub use session::{Session, SessionStore};
pub use types::{now_ms, Address, ConversationId};
