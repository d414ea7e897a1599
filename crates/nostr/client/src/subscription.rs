//! Subscription multiplexing over one relay connection.
//!
//! The [`Multiplexer`] owns every subscription of a relay, across transport
//! reconnections. A [`Subscription`] is the consumer's end: a stream of
//! events fed through a bounded channel, so a slow consumer holds up the
//! dispatcher instead of losing events.

use crate::connection::LazyConnection;
use crate::error::{ClientError, Result};
use crate::message::ClientMessage;
use futures_util::Stream;
use nostr::{Event, Filter};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Per-call subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Subscription id to use instead of a generated one.
    pub id: Option<String>,
    /// Keep streaming after EOSE. When false the stream ends at EOSE.
    pub realtime: bool,
    /// Buffered events before the dispatcher waits for the consumer.
    pub buffer_size: Option<usize>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            id: None,
            realtime: true,
            buffer_size: None,
        }
    }
}

impl SubscribeOptions {
    pub fn realtime() -> Self {
        Self::default()
    }

    /// Stored events only: the stream completes at EOSE.
    pub fn one_shot() -> Self {
        Self {
            realtime: false,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }
}

/// Where a subscription stands with respect to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Registered, not pulled yet.
    Pending,
    /// Pulled, waiting for an open connection to send the REQ.
    Requesting,
    /// REQ sent on the given transport generation.
    Requested { generation: u64 },
}

#[derive(Default)]
struct SubscriptionShared {
    eose: AtomicBool,
    terminal: std::sync::Mutex<Option<ClientError>>,
}

impl SubscriptionShared {
    fn set_terminal(&self, error: ClientError) {
        let mut terminal = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if terminal.is_none() {
            *terminal = Some(error);
        }
    }

    fn take_terminal(&self) -> Option<ClientError> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

struct Entry {
    token: u64,
    filters: Vec<Filter>,
    realtime: bool,
    phase: Phase,
    events: mpsc::Sender<Event>,
    shared: Arc<SubscriptionShared>,
}

#[derive(Default)]
struct MuxState {
    entries: HashMap<String, Entry>,
    /// Newest transport generation whose open has been handled.
    last_open: u64,
}

/// Subscription registry for one connection.
pub(crate) struct Multiplexer {
    relay_url: String,
    connection: Arc<LazyConnection>,
    default_buffer: usize,
    state: Mutex<MuxState>,
    next_token: AtomicU64,
}

impl Multiplexer {
    pub(crate) fn new(connection: Arc<LazyConnection>, default_buffer: usize) -> Self {
        Self {
            relay_url: connection.url().to_string(),
            connection,
            default_buffer: default_buffer.max(1),
            state: Mutex::new(MuxState::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a subscription. Nothing is sent until the stream is polled.
    pub(crate) async fn register(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let id = options.id.unwrap_or_else(generate_subscription_id);
        let buffer = options.buffer_size.unwrap_or(self.default_buffer).max(1);
        let (events, receiver) = mpsc::channel(buffer);
        let shared = Arc::new(SubscriptionShared::default());
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock().await;
            if state.entries.contains_key(&id) {
                return Err(ClientError::DuplicateSubscription(id));
            }
            state.entries.insert(
                id.clone(),
                Entry {
                    token,
                    filters,
                    realtime: options.realtime,
                    phase: Phase::Pending,
                    events,
                    shared: Arc::clone(&shared),
                },
            );
        }
        debug!("registered subscription {} on {}", id, self.relay_url);

        Ok(Subscription {
            id,
            token,
            mux: Arc::clone(self),
            receiver,
            shared,
            request: None,
            started: false,
            finished: false,
        })
    }

    /// Send the REQ for a pending subscription, waiting for the connection.
    ///
    /// The REQ itself goes out under the registry lock, so a concurrent
    /// cancel either removes the entry first or sees it as requested and
    /// sends `CLOSE` after it.
    async fn request(&self, id: &str, token: u64) -> Result<()> {
        loop {
            {
                let mut state = self.state.lock().await;
                let Some(entry) = state.entries.get_mut(id).filter(|e| e.token == token) else {
                    return Ok(());
                };
                if entry.phase != Phase::Pending {
                    return Ok(());
                }
                entry.phase = Phase::Requesting;
            }

            if let Err(error) = self.connection.connect().await {
                self.remove_entry(id, token).await;
                return Err(error);
            }

            let mut state = self.state.lock().await;
            let last_open = state.last_open;
            let Some(entry) = state.entries.get_mut(id).filter(|e| e.token == token) else {
                return Ok(());
            };
            let sent = match req_message(id, entry.filters.clone()) {
                Ok(message) => self.connection.try_send_on(message).await,
                Err(error) => Err(error),
            };
            match sent {
                Ok(Some(generation)) if last_open <= generation => {
                    entry.phase = Phase::Requested { generation };
                    return Ok(());
                }
                // Closed again before the REQ went out, or a newer transport
                // already opened: wait for the current one.
                Ok(_) => entry.phase = Phase::Pending,
                Err(error) => {
                    state.entries.remove(id);
                    return Err(error);
                }
            }
        }
    }

    async fn remove_entry(&self, id: &str, token: u64) {
        let mut state = self.state.lock().await;
        if state.entries.get(id).is_some_and(|e| e.token == token) {
            state.entries.remove(id);
        }
    }

    /// Re-issue REQs sent on older transports once `generation` is open.
    pub(crate) async fn on_open(&self, generation: u64) {
        let mut state = self.state.lock().await;
        state.last_open = state.last_open.max(generation);
        for (id, entry) in &mut state.entries {
            let Phase::Requested { generation: sent_on } = entry.phase else {
                continue;
            };
            if sent_on >= generation {
                continue;
            }
            let sent = match req_message(id, entry.filters.clone()) {
                Ok(message) => self.connection.try_send_on(message).await,
                Err(error) => Err(error),
            };
            match sent {
                Ok(Some(sent_on)) => {
                    debug!("resubscribed {} on {}", id, self.relay_url);
                    entry.phase = Phase::Requested {
                        generation: sent_on,
                    };
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("failed to resubscribe {} on {}: {}", id, self.relay_url, error);
                }
            }
        }
    }

    /// Deliver an event, waiting while the subscription's buffer is full.
    pub(crate) async fn route_event(&self, id: &str, event: Event) {
        let target = {
            let state = self.state.lock().await;
            state
                .entries
                .get(id)
                .map(|entry| (entry.token, entry.events.clone()))
        };
        let Some((token, events)) = target else {
            debug!("event for unknown subscription {} on {}", id, self.relay_url);
            return;
        };
        if events.send(event).await.is_err() {
            self.cancel(id, token).await;
        }
    }

    pub(crate) async fn on_eose(&self, id: &str) {
        let completed = {
            let mut state = self.state.lock().await;
            match state.entries.get(id) {
                Some(entry) if entry.realtime => {
                    entry.shared.eose.store(true, Ordering::Relaxed);
                    false
                }
                Some(entry) => {
                    entry.shared.eose.store(true, Ordering::Relaxed);
                    state.entries.remove(id);
                    true
                }
                None => false,
            }
        };
        if completed {
            debug!("subscription {} on {} completed at EOSE", id, self.relay_url);
            self.send_close(id).await;
        }
    }

    /// The relay ended a subscription on its own.
    pub(crate) async fn on_closed(&self, id: &str, reason: &str) {
        let removed = self.state.lock().await.entries.remove(id);
        if let Some(entry) = removed {
            debug!("relay {} closed subscription {}: {}", self.relay_url, id, reason);
            entry.shared.set_terminal(ClientError::SubscriptionClosed {
                subscription_id: id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Terminate every subscription with `ConnectionClosed`.
    pub(crate) async fn fail_all(&self) {
        let entries: Vec<Entry> = {
            let mut state = self.state.lock().await;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.shared.set_terminal(ClientError::ConnectionClosed);
        }
    }

    /// Remove a subscription and tell the relay, at most once per token.
    async fn cancel(&self, id: &str, token: u64) {
        let removed = {
            let mut state = self.state.lock().await;
            if state.entries.get(id).is_some_and(|e| e.token == token) {
                state.entries.remove(id)
            } else {
                None
            }
        };
        if let Some(entry) = removed
            && matches!(entry.phase, Phase::Requested { .. })
        {
            self.send_close(id).await;
        }
    }

    async fn send_close(&self, id: &str) {
        let sent = match ClientMessage::Close(id.to_string()).to_json() {
            Ok(message) => self.connection.send_if_open(message).await,
            Err(error) => Err(error),
        };
        if let Err(error) = sent {
            debug!("failed to close {} on {}: {}", id, self.relay_url, error);
        }
    }

    /// Whether any subscription has asked the relay for events.
    pub(crate) async fn has_requested(&self) -> bool {
        self.state
            .lock()
            .await
            .entries
            .values()
            .any(|entry| entry.phase != Phase::Pending)
    }

    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

fn req_message(id: &str, filters: Vec<Filter>) -> Result<String> {
    ClientMessage::Req {
        subscription_id: id.to_string(),
        filters,
    }
    .to_json()
}

type RequestFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Stream of events for one subscription.
///
/// The REQ goes out on the first poll. The stream ends after EOSE for
/// one-shot subscriptions, and yields a final error when the relay closes
/// the subscription or the relay is closed. Dropping it (or calling
/// [`close`](Self::close)) sends `CLOSE` to the relay.
pub struct Subscription {
    id: String,
    token: u64,
    mux: Arc<Multiplexer>,
    receiver: mpsc::Receiver<Event>,
    shared: Arc<SubscriptionShared>,
    request: Option<RequestFuture>,
    started: bool,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the relay has signalled the end of stored events.
    pub fn has_eose(&self) -> bool {
        self.shared.eose.load(Ordering::Relaxed)
    }

    /// Next event, `None` once the subscription is over.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        futures_util::StreamExt::next(self).await
    }

    /// Cancel the subscription. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.request = None;
        self.receiver.close();
        self.mux.cancel(&self.id, self.token).await;
    }
}

impl Stream for Subscription {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if !this.started {
            this.started = true;
            let mux = Arc::clone(&this.mux);
            let id = this.id.clone();
            let token = this.token;
            this.request = Some(Box::pin(async move { mux.request(&id, token).await }));
        }

        if let Some(request) = this.request.as_mut() {
            match request.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => this.request = None,
                Poll::Ready(Err(error)) => {
                    this.request = None;
                    this.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Pending => {}
            }
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(this.shared.take_terminal().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mux = Arc::clone(&self.mux);
        let id = std::mem::take(&mut self.id);
        let token = self.token;
        runtime.spawn(async move { mux.cancel(&id, token).await });
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
