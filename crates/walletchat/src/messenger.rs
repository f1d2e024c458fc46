//! Command and snapshot surface for a UI.

use crate::config::ClientConfig;
use crate::network::MessagingNetwork;
use crate::pipeline::{MessagePipeline, MessageStream, Subscription};
use crate::registry::ConversationRegistry;
use crate::types::ConversationId;
use crate::{
    Address, Conversation, IdentityBinder, Message, Result, Session, SessionStore, WalletSigner,
};
use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub address: Address,
    #[serde(with = "crate::types::serde_pubkey")]
    pub public_key: PublicKey,
    pub activated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub peer: Address,
    pub open: bool,
    pub created_at: u64,
    pub last_activity: u64,
    /// Empty for closed conversations.
    pub messages: Vec<Message>,
}

/// Everything a UI needs to render the current state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub session: Option<SessionSnapshot>,
    pub conversations: Vec<ConversationSnapshot>,
}

pub struct Messenger {
    binder: IdentityBinder,
    sessions: Arc<SessionStore>,
    registry: ConversationRegistry,
    pipeline: MessagePipeline,
}

impl Messenger {
    /// Create a messenger on the current Tokio runtime.
    pub fn new(network: Arc<dyn MessagingNetwork>, config: ClientConfig) -> Result<Self> {
        let sessions = Arc::new(SessionStore::new(network));
        let pipeline = MessagePipeline::new(sessions.clone(), config)?;
        Ok(Self {
            binder: IdentityBinder::new(),
            sessions,
            registry: ConversationRegistry::new(),
            pipeline,
        })
    }

    /// Ask the wallet to sign the challenge for `address` and start a session
    /// as the resulting identity, replacing any current session.
    pub async fn sign_in(&self, address: &str, signer: &dyn WalletSigner) -> Result<Arc<Session>> {
        let identity = self.binder.bind(address, signer).await?;
        self.sessions.activate(identity).await
    }

    pub fn sign_out(&self) {
        if let Some(session) = self.sessions.current() {
            info!(address = %session.address(), "signing out");
        }
        self.sessions.deactivate();
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.sessions.current()
    }

    pub fn open_conversation(&self, counterparty: &str) -> Result<Conversation> {
        let session = self.sessions.require_current()?;
        self.registry.open(&session, counterparty)
    }

    pub fn close_conversation(&self, conversation: &Conversation) {
        self.registry.close(conversation);
    }

    pub fn conversation(&self, counterparty: &Address) -> Option<Conversation> {
        let session = self.sessions.current()?;
        self.registry.get(&session, counterparty)
    }

    /// Conversations of the signed-in address, most recently active first.
    pub fn conversations(&self) -> Vec<Conversation> {
        match self.sessions.current() {
            Some(session) => self.registry.list(&session),
            None => Vec::new(),
        }
    }

    pub fn send_message(&self, conversation: &Conversation, text: &str) -> Result<Message> {
        self.pipeline.send(conversation, text)
    }

    pub fn resend(&self, conversation: &Conversation, message_id: &Uuid) -> Result<Message> {
        self.pipeline.resend(conversation, message_id)
    }

    pub fn fetch_history(&self, conversation: &Conversation) -> Result<MessageStream> {
        self.pipeline.fetch_history(conversation)
    }

    pub async fn subscribe<F>(&self, conversation: &Conversation, on_message: F) -> Result<Subscription>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.pipeline.subscribe(conversation, on_message).await
    }

    pub fn snapshot(&self) -> Snapshot {
        let Some(session) = self.sessions.current() else {
            return Snapshot::default();
        };

        let conversations = self
            .registry
            .list(&session)
            .into_iter()
            .map(|conversation| {
                let open = conversation.is_open();
                ConversationSnapshot {
                    id: conversation.id().clone(),
                    peer: conversation.peer().clone(),
                    open,
                    created_at: conversation.created_at(),
                    last_activity: conversation.last_activity(),
                    messages: if open { conversation.messages() } else { Vec::new() },
                }
            })
            .collect();

        Snapshot {
            session: Some(SessionSnapshot {
                id: session.id(),
                address: session.address().clone(),
                public_key: session.identity().public_key(),
                activated_at: session.activated_at(),
            }),
            conversations,
        }
    }
}
