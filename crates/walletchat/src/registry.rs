use crate::{Address, Conversation, Error, Result, Session};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    /// owner -> peer -> conversation
    by_owner: HashMap<Address, HashMap<Address, Conversation>>,
    next_ordinal: u64,
}

/// Conversations keyed by (owner, counterparty), one per pair.
#[derive(Default)]
pub struct ConversationRegistry {
    state: Mutex<RegistryState>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the conversation with `counterparty`, creating it on first use.
    ///
    /// Repeated opens hand out the same conversation; a closed one is
    /// re-opened with its history intact.
    pub fn open(&self, session: &Session, counterparty: &str) -> Result<Conversation> {
        session.ensure_active()?;
        let peer = Address::parse(counterparty)?;
        let owner = session.address();
        if &peer == owner {
            return Err(Error::InvalidAddress(format!(
                "{} is your own address",
                peer
            )));
        }

        let mut state = self.state.lock().unwrap();
        let ordinal = state.next_ordinal;
        let conversations = state.by_owner.entry(owner.clone()).or_default();
        if let Some(existing) = conversations.get(&peer) {
            let existing = existing.clone();
            existing.set_open(true);
            return Ok(existing);
        }

        let conversation = Conversation::new(owner.clone(), peer.clone(), ordinal);
        conversations.insert(peer, conversation.clone());
        state.next_ordinal += 1;
        debug!(conversation = %conversation.id(), peer = %conversation.peer(), "conversation created");
        Ok(conversation)
    }

    pub fn get(&self, session: &Session, counterparty: &Address) -> Option<Conversation> {
        self.state
            .lock()
            .unwrap()
            .by_owner
            .get(session.address())
            .and_then(|conversations| conversations.get(counterparty))
            .cloned()
    }

    /// The session owner's conversations, most recently active first.
    pub fn list(&self, session: &Session) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .state
            .lock()
            .unwrap()
            .by_owner
            .get(session.address())
            .map(|conversations| conversations.values().cloned().collect())
            .unwrap_or_default();

        conversations.sort_by_cached_key(|c| Reverse((c.last_activity(), c.ordinal())));
        conversations
    }

    /// Mark closed; messages are kept.
    pub fn close(&self, conversation: &Conversation) {
        conversation.set_open(false);
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .by_owner
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryNetwork;
    use crate::{Identity, SessionStore};
    use std::sync::Arc;

    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";
    const CAROL: &str = "0x00000000000000000000000000000000000ca401";

    async fn session(store: &SessionStore, address: &str) -> Arc<Session> {
        let identity = Identity::derive(Address::parse(address).unwrap(), &[5u8; 65]).unwrap();
        store.activate(Arc::new(identity)).await.unwrap()
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let session = session(&store, ALICE).await;
        let registry = ConversationRegistry::new();

        let first = registry.open(&session, BOB).unwrap();
        let second = registry.open(&session, &BOB.to_uppercase().replace("0X", "0x")).unwrap();

        assert!(first.same_as(&second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn open_validates_the_counterparty() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let session = session(&store, ALICE).await;
        let registry = ConversationRegistry::new();

        assert!(matches!(registry.open(&session, "0xnope"), Err(Error::InvalidAddress(_))));
        assert!(matches!(registry.open(&session, ALICE), Err(Error::InvalidAddress(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn open_requires_an_active_session() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let session = session(&store, ALICE).await;
        store.deactivate();
        let registry = ConversationRegistry::new();
        assert!(matches!(registry.open(&session, BOB), Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn close_keeps_history_and_open_reopens() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let session = session(&store, ALICE).await;
        let registry = ConversationRegistry::new();

        let conversation = registry.open(&session, BOB).unwrap();
        conversation.append_outgoing("kept").unwrap();
        registry.close(&conversation);
        assert!(!conversation.is_open());

        let reopened = registry.open(&session, BOB).unwrap();
        assert!(reopened.is_open());
        assert_eq!(reopened.messages()[0].content, "kept");
    }

    #[tokio::test]
    async fn list_orders_by_recent_activity() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let session = session(&store, ALICE).await;
        let registry = ConversationRegistry::new();

        let bob = registry.open(&session, BOB).unwrap();
        let carol = registry.open(&session, CAROL).unwrap();
        bob.merge(vec![crate::Envelope {
            sender: bob.peer().clone(),
            recipient: bob.owner().clone(),
            sent_at: crate::types::now_ms() + 60_000,
            content: "bump".to_string(),
        }])
        .await;

        let listed = registry.list(&session);
        assert_eq!(listed.len(), 2);
        assert!(listed[0].same_as(&bob));
        assert!(listed[1].same_as(&carol));
    }

    #[tokio::test]
    async fn conversations_are_scoped_to_the_owner() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let registry = ConversationRegistry::new();

        let alice = session(&store, ALICE).await;
        registry.open(&alice, BOB).unwrap();
        let carol = session(&store, CAROL).await;

        assert!(registry.list(&carol).is_empty());
        assert!(registry.get(&carol, &Address::parse(BOB).unwrap()).is_none());
    }
}
