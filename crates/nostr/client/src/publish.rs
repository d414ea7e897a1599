//! Publish acknowledgement correlation.
//!
//! Each pending publish is keyed by event id and settled exactly once: by a
//! matching `OK`, or by the close of the transport it was sent on.

use crate::connection::LazyConnection;
use crate::error::{ClientError, Result};
use crate::message::ClientMessage;
use nostr::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Publish confirmation from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

struct Pending {
    token: u64,
    event: Event,
    /// Transport generation the EVENT went out on, once sent.
    generation: Option<u64>,
    reply: oneshot::Sender<Result<String>>,
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<String, Pending>,
    /// Newest transport generation known to be closed.
    last_closed: u64,
}

pub(crate) struct PublishCorrelator {
    relay_url: String,
    connection: Arc<LazyConnection>,
    state: Mutex<CorrelatorState>,
    next_token: AtomicU64,
}

impl PublishCorrelator {
    pub(crate) fn new(connection: Arc<LazyConnection>) -> Self {
        Self {
            relay_url: connection.url().to_string(),
            connection,
            state: Mutex::new(CorrelatorState::default()),
            next_token: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `event` and wait for its acknowledgement.
    ///
    /// Resolves to the relay's `OK` message text when accepted.
    pub(crate) async fn publish(&self, event: &Event) -> Result<String> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply, outcome) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.pending.contains_key(&event.id) {
                return Err(ClientError::DuplicatePublish(event.id.clone()));
            }
            state.pending.insert(
                event.id.clone(),
                Pending {
                    token,
                    event: event.clone(),
                    generation: None,
                    reply,
                },
            );
        }
        let _guard = PendingGuard {
            correlator: self,
            event_id: &event.id,
            token,
        };

        let message = ClientMessage::Event(event.clone()).to_json()?;
        let generation = self.connection.send_on(message).await?;

        {
            let mut state = self.lock();
            let closed_already = state.last_closed >= generation;
            let ours = state
                .pending
                .get(&event.id)
                .is_some_and(|pending| pending.token == token);
            if ours && closed_already {
                if let Some(pending) = state.pending.remove(&event.id) {
                    let _ = pending.reply.send(Err(ClientError::ConnectionClosed));
                }
            } else if ours && let Some(pending) = state.pending.get_mut(&event.id) {
                pending.generation = Some(generation);
            }
        }
        debug!("published {} to {}", event.id, self.relay_url);

        outcome.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Settle the pending publish matching an `OK` message.
    pub(crate) fn on_ok(&self, event_id: &str, accepted: bool, message: &str) {
        let Some(pending) = self.lock().pending.remove(event_id) else {
            debug!("OK for unknown event {} from {}", event_id, self.relay_url);
            return;
        };
        let outcome = if accepted {
            Ok(message.to_string())
        } else {
            Err(ClientError::EventRejected {
                reason: message.to_string(),
                event: Box::new(pending.event),
            })
        };
        let _ = pending.reply.send(outcome);
    }

    /// Fail every publish sent on `generation` or earlier.
    pub(crate) fn on_closed(&self, generation: u64) {
        let failed: Vec<Pending> = {
            let mut state = self.lock();
            state.last_closed = state.last_closed.max(generation);
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.generation.is_some_and(|sent| sent <= generation))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .collect()
        };
        for pending in failed {
            let _ = pending.reply.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Fail every outstanding publish.
    pub(crate) fn fail_all(&self) {
        let failed: Vec<Pending> = self.lock().pending.drain().map(|(_, p)| p).collect();
        for pending in failed {
            let _ = pending.reply.send(Err(ClientError::ConnectionClosed));
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Drops the pending entry when the publish future ends, however it ends.
struct PendingGuard<'a> {
    correlator: &'a PublishCorrelator,
    event_id: &'a str,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.correlator.lock();
        if state
            .pending
            .get(self.event_id)
            .is_some_and(|pending| pending.token == self.token)
        {
            state.pending.remove(self.event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransportFactory;
    use nostr::{EventTemplate, Keys};
    use std::time::Duration;
    use tokio::time::timeout;
    use url::Url;

    fn correlator(factory: &MemoryTransportFactory) -> Arc<PublishCorrelator> {
        let connection = Arc::new(LazyConnection::new(
            Url::parse("wss://relay.example").unwrap(),
            Arc::new(factory.clone()),
        ));
        Arc::new(PublishCorrelator::new(connection))
    }

    fn event(content: &str) -> Event {
        Keys::generate()
            .sign(&EventTemplate::new(1, content))
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_ok_resolves() {
        let factory = MemoryTransportFactory::auto_open();
        let correlator = correlator(&factory);
        let event = event("accepted");

        let task = {
            let correlator = Arc::clone(&correlator);
            let event = event.clone();
            tokio::spawn(async move { correlator.publish(&event).await })
        };
        let peer = factory.wait_for_peer(0).await;
        let sent = peer.wait_for_sent(1).await;
        assert!(sent[0].starts_with("[\"EVENT\""));

        correlator.on_ok(&event.id, true, "");
        assert_eq!(task.await.unwrap().unwrap(), "");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejected_ok_carries_reason_and_event() {
        let factory = MemoryTransportFactory::auto_open();
        let correlator = correlator(&factory);
        let event = event("rejected");

        let task = {
            let correlator = Arc::clone(&correlator);
            let event = event.clone();
            tokio::spawn(async move { correlator.publish(&event).await })
        };
        factory.wait_for_peer(0).await.wait_for_sent(1).await;
        correlator.on_ok(&event.id, false, "blocked: test");

        match task.await.unwrap() {
            Err(ClientError::EventRejected {
                reason,
                event: rejected,
            }) => {
                assert_eq!(reason, "blocked: test");
                assert_eq!(*rejected, event);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_pending_publish_is_refused() {
        let factory = MemoryTransportFactory::auto_open();
        let correlator = correlator(&factory);
        let event = event("twice");

        let first = {
            let correlator = Arc::clone(&correlator);
            let event = event.clone();
            tokio::spawn(async move { correlator.publish(&event).await })
        };
        factory.wait_for_peer(0).await.wait_for_sent(1).await;
        assert!(matches!(
            correlator.publish(&event).await,
            Err(ClientError::DuplicatePublish(id)) if id == event.id
        ));

        correlator.on_ok(&event.id, true, "");
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_of_sending_generation_fails_publish() {
        let factory = MemoryTransportFactory::auto_open();
        let correlator = correlator(&factory);
        let event = event("dropped");

        let task = {
            let correlator = Arc::clone(&correlator);
            let event = event.clone();
            tokio::spawn(async move { correlator.publish(&event).await })
        };
        factory.wait_for_peer(0).await.wait_for_sent(1).await;
        correlator.on_closed(1);
        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn abandoned_publish_releases_its_id() {
        let factory = MemoryTransportFactory::auto_open();
        let correlator = correlator(&factory);
        let event = event("abandoned");

        let abandoned = timeout(Duration::from_millis(50), correlator.publish(&event)).await;
        assert!(abandoned.is_err());
        assert_eq!(correlator.pending_count(), 0);
    }
}
