//! Loopback messaging network shared by every client in the process.

use crate::network::{Connection, Envelope, EnvelopeStream, HistoryPage, MessagingNetwork, Receipt};
use crate::types::ConversationId;
use crate::{Address, Error, Identity, Result};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

const PUSH_CAPACITY: usize = 1024;

#[derive(Default)]
struct Faults {
    fail_connect: bool,
    fail_next_publishes: usize,
    fail_all_publishes: bool,
    withhold_confirmations: bool,
    reject_confirmations: bool,
    stalled_recipients: HashSet<Address>,
    fail_fetches: bool,
}

#[derive(Default)]
struct HubState {
    history: HashMap<ConversationId, Vec<Envelope>>,
    stored: HashSet<String>,
    faults: Faults,
    publish_attempts: usize,
    fetch_calls: usize,
    connections: usize,
}

struct Hub {
    state: Mutex<HubState>,
    pushes: broadcast::Sender<Envelope>,
}

impl Hub {
    fn store(&self, envelope: Envelope) -> Receipt {
        let receipt = Receipt {
            id: uuid::Uuid::new_v4().to_string(),
        };
        {
            let mut state = self.state.lock().unwrap();
            let key = ConversationId::for_pair(&envelope.sender, &envelope.recipient);
            state.history.entry(key).or_default().push(envelope.clone());
            state.stored.insert(receipt.id.clone());
        }
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.pushes.send(envelope);
        receipt
    }
}

/// In-process [`MessagingNetwork`] with fault injection.
#[derive(Clone)]
pub struct InMemoryNetwork {
    hub: Arc<Hub>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        let (pushes, _) = broadcast::channel(PUSH_CAPACITY);
        Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState::default()),
                pushes,
            }),
        }
    }

    /// Deliver an envelope as if another client had published it.
    pub fn inject(&self, envelope: Envelope) -> Receipt {
        self.hub.store(envelope)
    }

    pub fn fail_connect(&self, fail: bool) {
        self.hub.state.lock().unwrap().faults.fail_connect = fail;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.hub.state.lock().unwrap().faults.fail_next_publishes = count;
    }

    pub fn fail_all_publishes(&self, fail: bool) {
        self.hub.state.lock().unwrap().faults.fail_all_publishes = fail;
    }

    /// Confirmations never resolve while set.
    pub fn withhold_confirmations(&self, withhold: bool) {
        self.hub.state.lock().unwrap().faults.withhold_confirmations = withhold;
    }

    /// Confirmations resolve with an error while set.
    pub fn reject_confirmations(&self, reject: bool) {
        self.hub.state.lock().unwrap().faults.reject_confirmations = reject;
    }

    /// Publishes addressed to `recipient` hang until the connection's caller gives up.
    pub fn stall_publishes_to(&self, recipient: &Address, stall: bool) {
        let stalled = &mut self.hub.state.lock().unwrap().faults.stalled_recipients;
        if stall {
            stalled.insert(recipient.clone());
        } else {
            stalled.remove(recipient);
        }
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.hub.state.lock().unwrap().faults.fail_fetches = fail;
    }

    pub fn publish_attempts(&self) -> usize {
        self.hub.state.lock().unwrap().publish_attempts
    }

    pub fn fetch_calls(&self) -> usize {
        self.hub.state.lock().unwrap().fetch_calls
    }

    pub fn connections(&self) -> usize {
        self.hub.state.lock().unwrap().connections
    }

    pub fn history(&self, a: &Address, b: &Address) -> Vec<Envelope> {
        self.hub
            .state
            .lock()
            .unwrap()
            .history
            .get(&ConversationId::for_pair(a, b))
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingNetwork for InMemoryNetwork {
    fn connect(&self, identity: Arc<Identity>) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let mut state = self.hub.state.lock().unwrap();
            if state.faults.fail_connect {
                return Err(Error::TransportFailure("network unreachable".to_string()));
            }
            state.connections += 1;
            let connection: Arc<dyn Connection> = Arc::new(MemoryConnection {
                hub: self.hub.clone(),
                address: identity.address().clone(),
                closed: AtomicBool::new(false),
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    hub: Arc<Hub>,
    address: Address,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportFailure("connection closed".to_string()));
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Receipt>> {
        Box::pin(async move {
            self.ensure_open()?;
            if envelope.sender != self.address {
                return Err(Error::TransportFailure(format!(
                    "cannot publish as {} from {}",
                    envelope.sender, self.address
                )));
            }
            let stalled = {
                let mut state = self.hub.state.lock().unwrap();
                state.publish_attempts += 1;
                if state.faults.fail_all_publishes {
                    return Err(Error::TransportFailure("publish rejected".to_string()));
                }
                if state.faults.fail_next_publishes > 0 {
                    state.faults.fail_next_publishes -= 1;
                    return Err(Error::TransportFailure("publish timed out".to_string()));
                }
                state.faults.stalled_recipients.contains(&envelope.recipient)
            };
            if stalled {
                futures::future::pending::<()>().await;
            }
            Ok(self.hub.store(envelope.clone()))
        })
    }

    fn await_confirmation<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let (withheld, rejected, stored) = {
                let state = self.hub.state.lock().unwrap();
                (
                    state.faults.withhold_confirmations,
                    state.faults.reject_confirmations,
                    state.stored.contains(&receipt.id),
                )
            };
            if withheld {
                futures::future::pending::<()>().await;
            }
            if rejected {
                return Err(Error::TransportFailure(format!(
                    "relay dropped {}",
                    receipt.id
                )));
            }
            if !stored {
                return Err(Error::TransportFailure(format!(
                    "unknown receipt {}",
                    receipt.id
                )));
            }
            Ok(())
        })
    }

    fn fetch_page<'a>(
        &'a self,
        peer: &'a Address,
        page: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Result<HistoryPage>> {
        Box::pin(async move {
            self.ensure_open()?;
            let offset = match page {
                Some(token) => token
                    .parse::<usize>()
                    .map_err(|_| Error::TransportFailure(format!("bad page token {:?}", token)))?,
                None => 0,
            };

            let mut state = self.hub.state.lock().unwrap();
            state.fetch_calls += 1;
            if state.faults.fail_fetches {
                return Err(Error::TransportFailure("history unavailable".to_string()));
            }
            let history = state
                .history
                .get(&ConversationId::for_pair(&self.address, peer))
                .map(Vec::as_slice)
                .unwrap_or_default();

            let end = history.len().min(offset.saturating_add(limit.max(1)));
            let envelopes = history.get(offset..end).unwrap_or_default().to_vec();
            let next = (end < history.len()).then(|| end.to_string());
            Ok(HistoryPage { envelopes, next })
        })
    }

    fn subscribe<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, Result<EnvelopeStream>> {
        Box::pin(async move {
            self.ensure_open()?;
            let rx = self.hub.pushes.subscribe();
            let me = self.address.clone();
            let peer = peer.clone();

            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => return Some((envelope, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "push subscriber lagged; fetch history to re-sync");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .filter(move |envelope| futures::future::ready(envelope.is_between(&me, &peer)));

            Ok(stream.boxed())
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
