//! Delivery pipeline: optimistic sends with bounded retry, history sync and
//! push subscriptions.
//!
//! Sends never report transport errors to the caller. The message is appended
//! as `Pending` right away, and the outcome of delivery shows up later as its
//! status: `Sent`, `Confirmed` or `Failed` with a [`FailureReason`].

use crate::config::{ClientConfig, RetryPolicy};
use crate::network::{Envelope, EnvelopeStream, HistoryPage, Receipt};
use crate::{
    Address, Conversation, DeliveryStatus, Error, FailureReason, Message, Result, Session,
    SessionStore,
};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type MessageStream = BoxStream<'static, Result<Message>>;

type Outboxes = Arc<Mutex<HashMap<crate::ConversationId, mpsc::UnboundedSender<Outbound>>>>;

struct Outbound {
    session: Arc<Session>,
    conversation: Conversation,
    message_id: Uuid,
    envelope: Envelope,
}

pub struct MessagePipeline {
    sessions: Arc<SessionStore>,
    config: ClientConfig,
    runtime: Handle,
    /// One delivery task per conversation keeps sends in submission order.
    outboxes: Outboxes,
}

impl MessagePipeline {
    /// Must be called from within a Tokio runtime; background delivery runs on it.
    pub fn new(sessions: Arc<SessionStore>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(Self {
            sessions,
            config,
            runtime,
            outboxes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn session_for(&self, conversation: &Conversation) -> Result<Arc<Session>> {
        let session = self.sessions.require_current()?;
        if session.address() != conversation.owner() {
            return Err(Error::SessionExpired);
        }
        Ok(session)
    }

    /// Append `text` as a `Pending` message and deliver it in the background.
    pub fn send(&self, conversation: &Conversation, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let session = self.session_for(conversation)?;
        let message = conversation.append_outgoing(text)?;

        let envelope = Envelope {
            sender: message.sender.clone(),
            recipient: conversation.peer().clone(),
            sent_at: message.sent_at,
            content: message.content.clone(),
        };
        self.enqueue(Outbound {
            session,
            conversation: conversation.clone(),
            message_id: message.id,
            envelope,
        });
        Ok(message)
    }

    /// Send the content of a failed message again as a new message.
    ///
    /// The failed entry stays where it is.
    pub fn resend(&self, conversation: &Conversation, message_id: &Uuid) -> Result<Message> {
        let failed = conversation
            .message(message_id)
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
        if !failed.is_outgoing() || failed.status != DeliveryStatus::Failed {
            return Err(Error::NotRetryable(format!(
                "message {} is {:?}",
                message_id, failed.status
            )));
        }
        self.send(conversation, &failed.content)
    }

    fn enqueue(&self, job: Outbound) {
        let mut outboxes = self.outboxes.lock().unwrap();
        let key = job.conversation.id().clone();

        let job = match outboxes.get(&key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the task below finishes.
        let _ = tx.send(job);
        self.runtime.spawn(run_outbox(
            key.clone(),
            rx,
            self.outboxes.clone(),
            self.config.clone(),
            self.runtime.clone(),
        ));
        outboxes.insert(key, tx);
    }

    /// Conversations with a live delivery task.
    pub(crate) fn outbox_count(&self) -> usize {
        self.outboxes.lock().unwrap().len()
    }

    /// Lazily pull the conversation's history from the network and merge it.
    ///
    /// Pages are only requested as the stream is polled. The stream yields
    /// the conversation's copy of every fetched message, so duplicates come
    /// back as the entry already present. Calling it again re-syncs.
    pub fn fetch_history(&self, conversation: &Conversation) -> Result<MessageStream> {
        let session = self.session_for(conversation)?;
        let state = FetchState {
            session,
            conversation: conversation.clone(),
            policy: self.config.retry.clone(),
            page_size: self.config.history_page_size,
            token: None,
            done: false,
        };

        let pages = stream::try_unfold(state, |mut state| async move {
            if state.done {
                return Ok(None);
            }
            state.session.ensure_active()?;

            let page = fetch_page_with_retry(
                &state.session,
                state.conversation.peer(),
                state.token.take(),
                state.page_size,
                &state.policy,
            )
            .await?;

            state.done = page.next.is_none() || page.envelopes.is_empty();
            state.token = page.next;
            let messages = state.conversation.merge(page.envelopes).await;
            Ok::<_, Error>(Some((messages, state)))
        });

        Ok(pages
            .map_ok(|messages| stream::iter(messages.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    /// Register `on_message` for new messages in `conversation` and start
    /// receiving pushes from the network.
    ///
    /// The callback runs once per newly merged message, whether it arrived by
    /// push or through [`MessagePipeline::fetch_history`], in merge order.
    pub async fn subscribe<F>(&self, conversation: &Conversation, on_message: F) -> Result<Subscription>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let session = self.session_for(conversation)?;
        let listener_id = conversation.add_listener(Arc::new(on_message));

        let pushes = match session.connection().subscribe(conversation.peer()).await {
            Ok(pushes) => pushes,
            Err(err) => {
                conversation.remove_listener(listener_id);
                return Err(err);
            }
        };

        let pump = self
            .runtime
            .spawn(run_pump(session, conversation.clone(), listener_id, pushes));

        Ok(Subscription {
            conversation: conversation.clone(),
            listener_id,
            pump: Mutex::new(Some(pump)),
        })
    }
}

impl Drop for MessagePipeline {
    fn drop(&mut self) {
        // Closing the senders lets idle outbox tasks finish.
        self.outboxes.lock().unwrap().clear();
    }
}

/// Handle returned by [`MessagePipeline::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    conversation: Conversation,
    listener_id: u64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Stop delivery. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        self.conversation.remove_listener(self.listener_id);
    }

    pub fn is_active(&self) -> bool {
        self.pump
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|pump| !pump.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct FetchState {
    session: Arc<Session>,
    conversation: Conversation,
    policy: RetryPolicy,
    page_size: usize,
    token: Option<String>,
    done: bool,
}

async fn run_outbox(
    key: crate::ConversationId,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    outboxes: Outboxes,
    config: ClientConfig,
    runtime: Handle,
) {
    loop {
        let job = match tokio::time::timeout(config.outbox_idle(), rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(_) => {
                // `enqueue` sends under this lock, and the entry for `key`
                // is our sender for as long as `rx` is alive.
                let mut outboxes = outboxes.lock().unwrap();
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        outboxes.remove(&key);
                        debug!(conversation = %key, "outbox idle");
                        return;
                    }
                }
            }
        };
        deliver(job, &config, &runtime).await;
    }
}

async fn deliver(job: Outbound, config: &ClientConfig, runtime: &Handle) {
    let Outbound {
        session,
        conversation,
        message_id,
        envelope,
    } = job;
    let fail = |reason: FailureReason| {
        conversation.transition(&message_id, DeliveryStatus::Failed, Some(reason));
    };

    let max_attempts = config.retry.attempts();
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if !session.is_active() {
            fail(FailureReason::SessionExpired);
            return;
        }

        let outcome = tokio::select! {
            result = session.connection().publish(&envelope) => result,
            _ = session.expired() => {
                fail(FailureReason::SessionExpired);
                return;
            }
        };

        match outcome {
            Ok(receipt) => {
                // Already confirmed if the network echoed it back first.
                if conversation.transition(&message_id, DeliveryStatus::Sent, None) {
                    debug!(message = %message_id, attempt, "message published");
                    runtime.spawn(watch_confirmation(
                        session,
                        conversation.clone(),
                        message_id,
                        receipt,
                        config.confirmation_timeout(),
                    ));
                }
                return;
            }
            Err(err) => {
                warn!(message = %message_id, attempt, max_attempts, error = %err, "publish failed");
                last_error = err.to_string();
            }
        }

        if attempt < max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(config.retry.backoff(attempt)) => {}
                _ = session.expired() => {
                    fail(FailureReason::SessionExpired);
                    return;
                }
            }
        }
    }

    info!(message = %message_id, attempts = max_attempts, "giving up on message");
    fail(FailureReason::TransportFailure {
        attempts: max_attempts,
        last_error,
    });
}

async fn watch_confirmation(
    session: Arc<Session>,
    conversation: Conversation,
    message_id: Uuid,
    receipt: Receipt,
    timeout: Duration,
) {
    let confirmation = tokio::select! {
        result = tokio::time::timeout(timeout, session.connection().await_confirmation(&receipt)) => result,
        _ = session.expired() => {
            conversation.transition(&message_id, DeliveryStatus::Failed, Some(FailureReason::SessionExpired));
            return;
        }
    };

    match confirmation {
        Ok(Ok(())) => {
            conversation.transition(&message_id, DeliveryStatus::Confirmed, None);
        }
        Ok(Err(err)) => {
            warn!(message = %message_id, error = %err, "confirmation failed");
            conversation.transition(
                &message_id,
                DeliveryStatus::Failed,
                Some(FailureReason::ConfirmationFailed {
                    error: err.to_string(),
                }),
            );
        }
        Err(_) => {
            warn!(message = %message_id, ?timeout, "confirmation timed out");
            conversation.transition(
                &message_id,
                DeliveryStatus::Failed,
                Some(FailureReason::ConfirmationTimeout),
            );
        }
    }
}

async fn fetch_page_with_retry(
    session: &Session,
    peer: &Address,
    token: Option<String>,
    page_size: usize,
    policy: &RetryPolicy,
) -> Result<HistoryPage> {
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            result = session.connection().fetch_page(peer, token.clone(), page_size) => result,
            _ = session.expired() => return Err(Error::SessionExpired),
        };
        match result {
            Ok(page) => return Ok(page),
            Err(err) if attempt < max_attempts => {
                warn!(%peer, attempt, max_attempts, error = %err, "history fetch failed");
                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff(attempt)) => {}
                    _ = session.expired() => return Err(Error::SessionExpired),
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn run_pump(
    session: Arc<Session>,
    conversation: Conversation,
    listener_id: u64,
    mut pushes: EnvelopeStream,
) {
    loop {
        let next = tokio::select! {
            envelope = pushes.next() => envelope,
            _ = session.expired() => None,
        };
        let Some(envelope) = next else {
            break;
        };
        conversation.merge(vec![envelope]).await;
    }
    conversation.remove_listener(listener_id);
    debug!(conversation = %conversation.id(), "subscription ended");
}
