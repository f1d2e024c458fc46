use crate::relay::LocalRelay;
use crate::{Error, Result, ANNOUNCEMENT_KIND, MESSAGE_KIND};
use futures::future::BoxFuture;
use futures::StreamExt;
use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, EventId, Kind, PublicKey, Tag, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use walletchat::{
    Address, Connection, Envelope, EnvelopeStream, HistoryPage, Identity, MessagingNetwork,
    Receipt,
};

/// Encrypted body of a [`MESSAGE_KIND`] event.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    sent_at: u64,
    content: String,
}

fn tag_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let vals = tag.clone().to_vec();
        if vals.first().map(|s| s.as_str()) == Some(name) {
            vals.get(1).cloned()
        } else {
            None
        }
    })
}

fn tag(name: &str, value: String) -> Result<Tag> {
    Tag::parse(&[name.to_string(), value]).map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// Public key of the newest announcement for `address`.
fn resolve(relay: &LocalRelay, address: &Address) -> Result<Option<PublicKey>> {
    let announcements = relay.query(|e| {
        e.kind == Kind::from(ANNOUNCEMENT_KIND as u16)
            && tag_value(e, "address").as_deref() == Some(address.as_str())
    })?;
    Ok(announcements.last().map(|e| e.pubkey))
}

/// [`MessagingNetwork`] backed by a nostr relay.
#[derive(Clone, Default)]
pub struct NostrNetwork {
    relay: LocalRelay,
}

impl NostrNetwork {
    pub fn new(relay: LocalRelay) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &LocalRelay {
        &self.relay
    }

    fn announce(&self, identity: &Identity) -> Result<()> {
        let tags = vec![
            tag("address", identity.address().to_string())?,
            tag("proof", hex::encode(identity.proof()))?,
        ];
        let event = EventBuilder::new(Kind::from(ANNOUNCEMENT_KIND as u16), "")
            .tags(tags)
            .custom_created_at(Timestamp::now())
            .build(identity.public_key())
            .sign_with_keys(identity.keys())
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        self.relay.publish(event)?;
        Ok(())
    }
}

impl MessagingNetwork for NostrNetwork {
    fn connect(
        &self,
        identity: Arc<Identity>,
    ) -> BoxFuture<'_, walletchat::Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            self.announce(&identity)?;
            info!(address = %identity.address(), public_key = %identity.public_key().to_hex(), "announced identity");
            let connection: Arc<dyn Connection> = Arc::new(NostrConnection {
                relay: self.relay.clone(),
                identity,
                closed: AtomicBool::new(false),
            });
            Ok(connection)
        })
    }
}

/// Connection of one identity to the relay.
pub struct NostrConnection {
    relay: LocalRelay,
    identity: Arc<Identity>,
    closed: AtomicBool,
}

impl NostrConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn decoder(&self, peer: &Address) -> Decoder {
        Decoder {
            relay: self.relay.clone(),
            identity: self.identity.clone(),
            peer: peer.clone(),
        }
    }

    fn seal(&self, envelope: &Envelope) -> Result<Event> {
        if &envelope.sender != self.identity.address() {
            return Err(Error::ForeignSender(envelope.sender.to_string()));
        }
        let recipient = resolve(&self.relay, &envelope.recipient)?
            .ok_or_else(|| Error::UnknownRecipient(envelope.recipient.to_string()))?;

        let payload = serde_json::to_string(&Payload {
            sent_at: envelope.sent_at,
            content: envelope.content.clone(),
        })?;
        let ciphertext = nip44::encrypt(
            self.identity.keys().secret_key(),
            &recipient,
            &payload,
            Version::V2,
        )?;

        EventBuilder::new(Kind::from(MESSAGE_KIND as u16), ciphertext)
            .tags(vec![tag("p", recipient.to_hex())?])
            .custom_created_at(Timestamp::from(envelope.sent_at / 1000))
            .build(self.identity.public_key())
            .sign_with_keys(self.identity.keys())
            .map_err(|e| Error::InvalidEvent(e.to_string()))
    }
}

impl Connection for NostrConnection {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, walletchat::Result<Receipt>> {
        Box::pin(async move {
            self.ensure_open()?;
            let event = self.seal(envelope)?;
            let id = self.relay.publish(event)?;
            debug!(event = %id.to_hex(), recipient = %envelope.recipient, "published message");
            Ok(Receipt { id: id.to_hex() })
        })
    }

    fn await_confirmation<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, walletchat::Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let id = EventId::from_hex(&receipt.id)
                .map_err(|e| Error::InvalidEvent(e.to_string()))?;
            if !self.relay.contains(&id)? {
                return Err(Error::UnknownEvent(receipt.id.clone()).into());
            }
            Ok(())
        })
    }

    fn fetch_page<'a>(
        &'a self,
        peer: &'a Address,
        page: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, walletchat::Result<HistoryPage>> {
        Box::pin(async move {
            self.ensure_open()?;
            let offset = match page {
                Some(token) => token
                    .parse::<usize>()
                    .map_err(|_| Error::BadPageToken(token))?,
                None => 0,
            };

            let decoder = self.decoder(peer);
            let events = self
                .relay
                .query(|e| e.kind == Kind::from(MESSAGE_KIND as u16))?;
            let envelopes: Vec<Envelope> = events.iter().filter_map(|e| decoder.open(e)).collect();

            let end = envelopes.len().min(offset.saturating_add(limit.max(1)));
            let next = (end < envelopes.len()).then(|| end.to_string());
            Ok(HistoryPage {
                envelopes: envelopes.get(offset..end).unwrap_or_default().to_vec(),
                next,
            })
        })
    }

    fn subscribe<'a>(&'a self, peer: &'a Address) -> BoxFuture<'a, walletchat::Result<EnvelopeStream>> {
        Box::pin(async move {
            self.ensure_open()?;
            let rx = self.relay.subscribe()?;
            let decoder = Arc::new(self.decoder(peer));

            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => return Some((event, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "relay subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .filter_map(move |event| {
                let decoder = decoder.clone();
                async move { decoder.open(&event) }
            });
            Ok(stream.boxed())
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Turns relay events between our identity and one peer back into envelopes.
struct Decoder {
    relay: LocalRelay,
    identity: Arc<Identity>,
    peer: Address,
}

impl Decoder {
    fn open(&self, event: &Event) -> Option<Envelope> {
        if event.kind != Kind::from(MESSAGE_KIND as u16) {
            return None;
        }
        let peer_key = match resolve(&self.relay, &self.peer) {
            Ok(Some(key)) => key,
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, "cannot resolve peer");
                return None;
            }
        };
        let me = self.identity.public_key();
        let tagged = tag_value(event, "p")?;

        let (sender, recipient) = if event.pubkey == me && tagged == peer_key.to_hex() {
            (self.identity.address().clone(), self.peer.clone())
        } else if event.pubkey == peer_key && tagged == me.to_hex() {
            (self.peer.clone(), self.identity.address().clone())
        } else {
            return None;
        };

        let plaintext = match nip44::decrypt(self.identity.keys().secret_key(), &peer_key, &event.content) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(event = %event.id.to_hex(), error = %err, "skipping undecryptable event");
                return None;
            }
        };
        let payload: Payload = match serde_json::from_str(&plaintext) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(event = %event.id.to_hex(), error = %err, "skipping malformed payload");
                return None;
            }
        };

        Some(Envelope {
            sender,
            recipient,
            sent_at: payload.sent_at,
            content: payload.content,
        })
    }
}
