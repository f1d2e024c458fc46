use crate::{Error, Result};
use nostr::{Event, EventId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Default)]
struct RelayState {
    /// Arrival order.
    events: Vec<Event>,
    ids: HashSet<EventId>,
    offline: bool,
}

struct RelayInner {
    state: Mutex<RelayState>,
    events_tx: broadcast::Sender<Event>,
}

/// In-process relay: stores verified events and broadcasts new ones.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl LocalRelay {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(RelayInner {
                state: Mutex::new(RelayState::default()),
                events_tx,
            }),
        }
    }

    /// Store `event` if its id and signature check out. Publishing an event
    /// the relay already holds is accepted and not re-broadcast.
    pub fn publish(&self, event: Event) -> Result<EventId> {
        if event.verify().is_err() {
            return Err(Error::InvalidEvent(format!(
                "bad id or signature on {}",
                event.id.to_hex()
            )));
        }

        let id = event.id;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.offline {
                return Err(Error::RelayOffline);
            }
            if !state.ids.insert(id) {
                debug!(event = %id.to_hex(), "duplicate event");
                return Ok(id);
            }
            state.events.push(event.clone());
        }
        let _ = self.inner.events_tx.send(event);
        Ok(id)
    }

    /// Stored events accepted by `predicate`, in arrival order.
    pub fn query<F>(&self, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let state = self.inner.state.lock().unwrap();
        if state.offline {
            return Err(Error::RelayOffline);
        }
        Ok(state.events.iter().filter(|e| predicate(e)).cloned().collect())
    }

    pub fn contains(&self, id: &EventId) -> Result<bool> {
        let state = self.inner.state.lock().unwrap();
        if state.offline {
            return Err(Error::RelayOffline);
        }
        Ok(state.ids.contains(id))
    }

    /// Live feed of events published from now on.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Event>> {
        if self.inner.state.lock().unwrap().offline {
            return Err(Error::RelayOffline);
        }
        Ok(self.inner.events_tx.subscribe())
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.state.lock().unwrap().offline = offline;
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    fn signed(content: &str) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::from(crate::MESSAGE_KIND as u16), content)
            .build(keys.public_key())
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn test_publish_and_query() {
        let relay = LocalRelay::new();
        let first = relay.publish(signed("a")).unwrap();
        relay.publish(signed("b")).unwrap();

        let all = relay.query(|_| true).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first);
        assert!(relay.contains(&first).unwrap());
    }

    #[test]
    fn test_duplicate_is_stored_once() {
        let relay = LocalRelay::new();
        let event = signed("once");
        relay.publish(event.clone()).unwrap();
        relay.publish(event).unwrap();
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn test_tampered_event_is_rejected() {
        let relay = LocalRelay::new();
        let mut event = signed("original");
        event.content = "forged".to_string();
        assert!(matches!(relay.publish(event), Err(Error::InvalidEvent(_))));
        assert!(relay.is_empty());
    }

    #[test]
    fn test_offline_relay_refuses_everything() {
        let relay = LocalRelay::new();
        relay.set_offline(true);
        assert!(matches!(relay.publish(signed("x")), Err(Error::RelayOffline)));
        assert!(matches!(relay.query(|_| true), Err(Error::RelayOffline)));
        assert!(relay.subscribe().is_err());

        relay.set_offline(false);
        assert!(relay.publish(signed("x")).is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_receive_new_events() {
        let relay = LocalRelay::new();
        let mut rx = relay.subscribe().unwrap();
        let id = relay.publish(signed("live")).unwrap();
        assert_eq!(rx.recv().await.unwrap().id, id);
    }
}
