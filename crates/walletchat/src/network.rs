use crate::{Address, Identity, Result};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The unit carried by the messaging network: one text message between two addresses.
///
/// Encryption happens inside the network client; at this boundary an envelope
/// is plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    /// Milliseconds since the UNIX epoch, chosen by the sender.
    pub sent_at: u64,
    pub content: String,
}

impl Envelope {
    pub fn is_between(&self, a: &Address, b: &Address) -> bool {
        (&self.sender == a && &self.recipient == b) || (&self.sender == b && &self.recipient == a)
    }
}

/// Acknowledgement that the network accepted a published envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub id: String,
}

/// One page of conversation history, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub envelopes: Vec<Envelope>,
    /// Token for the following page; `None` on the last page.
    pub next: Option<String>,
}

pub type EnvelopeStream = BoxStream<'static, Envelope>;

/// Messaging network client: transport, encryption and persistence live behind this.
pub trait MessagingNetwork: Send + Sync {
    /// Open a live connection authenticated as `identity`.
    fn connect(&self, identity: Arc<Identity>) -> BoxFuture<'_, Result<Arc<dyn Connection>>>;
}

/// A live, authenticated connection. Owned by the session store; everything
/// else only borrows it.
pub trait Connection: Send + Sync {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<Receipt>>;

    /// Resolves once the network has durably stored the published envelope.
    fn await_confirmation<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<()>>;

    fn fetch_page<'a>(
        &'a self,
        peer: &'a Address,
        page: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Result<HistoryPage>>;

    /// Push stream of envelopes exchanged with `peer`, including our own.
    fn subscribe<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, Result<EnvelopeStream>>;

    fn close(&self);
}
