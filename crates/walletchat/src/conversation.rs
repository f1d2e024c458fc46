use crate::message::{DedupKey, Direction};
use crate::network::Envelope;
use crate::types::{now_ms, ConversationId};
use crate::{Address, DeliveryStatus, Error, FailureReason, Message, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Callback registered through a subscription.
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

struct ConversationState {
    open: bool,
    /// Sorted by `(sent_at, seq)`.
    messages: Vec<Message>,
    dedup: HashMap<DedupKey, Uuid>,
    next_seq: u64,
    last_outgoing_at: u64,
    cursor: Option<u64>,
    last_activity: u64,
    listeners: BTreeMap<u64, Listener>,
    next_listener: u64,
}

impl ConversationState {
    fn insert(&mut self, mut message: Message) -> Message {
        message.seq = self.next_seq;
        self.next_seq += 1;

        let position = self
            .messages
            .partition_point(|m| m.sent_at <= message.sent_at);
        self.dedup.insert(message.dedup_key(), message.id);
        self.last_activity = self.last_activity.max(message.sent_at);
        self.messages.insert(position, message.clone());
        message
    }

    fn find_mut(&mut self, id: &Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }
}

/// Move `message` to `next` if the delivery state machine allows it.
fn advance(message: &mut Message, next: DeliveryStatus) -> bool {
    if !message.status.can_transition_to(next) {
        return false;
    }
    message.status = next;
    true
}

struct ConversationInner {
    id: ConversationId,
    owner: Address,
    peer: Address,
    created_at: u64,
    ordinal: u64,
    state: Mutex<ConversationState>,
    /// Serialises history merges and listener callbacks.
    dispatch: tokio::sync::Mutex<()>,
}

/// Shared handle to the conversation between the session owner and one peer.
#[derive(Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

impl Conversation {
    pub(crate) fn new(owner: Address, peer: Address, ordinal: u64) -> Self {
        let created_at = now_ms();
        Self {
            inner: Arc::new(ConversationInner {
                id: ConversationId::for_pair(&owner, &peer),
                owner,
                peer,
                created_at,
                ordinal,
                state: Mutex::new(ConversationState {
                    open: true,
                    messages: Vec::new(),
                    dedup: HashMap::new(),
                    next_seq: 0,
                    last_outgoing_at: 0,
                    cursor: None,
                    last_activity: created_at,
                    listeners: BTreeMap::new(),
                    next_listener: 0,
                }),
                dispatch: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.inner.id
    }

    pub fn owner(&self) -> &Address {
        &self.inner.owner
    }

    pub fn peer(&self) -> &Address {
        &self.inner.peer
    }

    pub fn created_at(&self) -> u64 {
        self.inner.created_at
    }

    pub(crate) fn ordinal(&self) -> u64 {
        self.inner.ordinal
    }

    /// True if both handles refer to the same conversation state.
    pub fn same_as(&self, other: &Conversation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().unwrap().open
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.inner.state.lock().unwrap().open = open;
    }

    /// Messages in conversation order.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().unwrap().messages.clone()
    }

    pub fn message(&self, id: &Uuid) -> Option<Message> {
        self.inner
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_activity(&self) -> u64 {
        self.inner.state.lock().unwrap().last_activity
    }

    /// Newest `sent_at` observed from the network. Never moves backwards.
    pub fn cursor(&self) -> Option<u64> {
        self.inner.state.lock().unwrap().cursor
    }

    /// Optimistically append a message from the owner, status `Pending`.
    pub(crate) fn append_outgoing(&self, content: &str) -> Result<Message> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.open {
            return Err(Error::ConversationClosed);
        }

        // Strictly increasing so two sends never share a dedup key.
        let mut sent_at = now_ms().max(state.last_outgoing_at.saturating_add(1));
        while sent_at < u64::MAX
            && state
                .dedup
                .contains_key(&DedupKey::new(&self.inner.owner, sent_at, content))
        {
            sent_at += 1;
        }
        state.last_outgoing_at = sent_at;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: self.inner.id.clone(),
            sender: self.inner.owner.clone(),
            direction: Direction::Outgoing,
            content: content.to_string(),
            sent_at,
            seq: 0,
            status: DeliveryStatus::Pending,
            failure: None,
        };
        Ok(state.insert(message))
    }

    /// Apply a delivery status change if the state machine allows it.
    pub(crate) fn transition(
        &self,
        id: &Uuid,
        next: DeliveryStatus,
        failure: Option<FailureReason>,
    ) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(message) = state.find_mut(id) else {
            return false;
        };
        let from = message.status;
        if !advance(message, next) {
            debug!(message = %id, ?from, to = ?next, "ignoring status change");
            return false;
        }
        if next == DeliveryStatus::Failed {
            message.failure = failure;
        }
        true
    }

    /// Merge envelopes from the network, dropping duplicates.
    ///
    /// Returns the canonical message for every envelope that belongs to this
    /// conversation. Newly inserted messages are handed to the listeners, in
    /// merge order, before this returns.
    pub(crate) async fn merge(&self, envelopes: Vec<Envelope>) -> Vec<Message> {
        let _dispatch = self.inner.dispatch.lock().await;

        let (canonical, inserted, listeners) = {
            let mut state = self.inner.state.lock().unwrap();
            let mut canonical = Vec::with_capacity(envelopes.len());
            let mut inserted = Vec::new();

            for envelope in envelopes {
                if !envelope.is_between(&self.inner.owner, &self.inner.peer) {
                    debug!(conversation = %self.inner.id, sender = %envelope.sender, "skipping foreign envelope");
                    continue;
                }
                state.cursor = Some(state.cursor.unwrap_or(0).max(envelope.sent_at));

                let key = DedupKey::new(&envelope.sender, envelope.sent_at, &envelope.content);
                if let Some(existing) = state.dedup.get(&key).copied() {
                    let Some(message) = state.find_mut(&existing) else {
                        continue;
                    };
                    // Our own message came back from the network, so it was
                    // published even if the outbox has not seen the receipt yet.
                    if message.is_outgoing() {
                        advance(message, DeliveryStatus::Sent);
                        advance(message, DeliveryStatus::Confirmed);
                    }
                    canonical.push(message.clone());
                    continue;
                }

                let direction = if envelope.sender == self.inner.owner {
                    if envelope.sent_at > state.last_outgoing_at {
                        state.last_outgoing_at = envelope.sent_at;
                    }
                    Direction::Outgoing
                } else {
                    Direction::Incoming
                };
                let message = state.insert(Message {
                    id: Uuid::new_v4(),
                    conversation_id: self.inner.id.clone(),
                    sender: envelope.sender,
                    direction,
                    content: envelope.content,
                    sent_at: envelope.sent_at,
                    seq: 0,
                    status: DeliveryStatus::Confirmed,
                    failure: None,
                });
                inserted.push(message.clone());
                canonical.push(message);
            }

            let listeners: Vec<Listener> = state.listeners.values().cloned().collect();
            (canonical, inserted, listeners)
        };

        for message in &inserted {
            for listener in &listeners {
                listener(message);
            }
        }
        canonical
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, listener);
        id
    }

    pub(crate) fn remove_listener(&self, id: u64) -> bool {
        self.inner.state.lock().unwrap().listeners.remove(&id).is_some()
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("peer", &self.inner.peer)
            .finish_non_exhaustive()
    }
}
