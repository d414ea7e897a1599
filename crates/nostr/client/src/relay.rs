//! Single relay façade.
//!
//! A [`Relay`] composes the lazy connection, the subscription multiplexer
//! and the publish correlator behind `subscribe` / `publish` / `close`.
//! Inbound traffic is handled by one dispatcher task per relay, started on
//! first use, which runs extension handlers before the default routing.

use crate::auth::AuthExtension;
use crate::connection::{ConnectionEvent, ConnectionState, LazyConnection};
use crate::error::{ClientError, Result};
use crate::extension::{Dispatch, ExtensionContext, ExtensionRegistry, RelayExtension};
use crate::message::{RelayMessage, parse_relay_message};
use crate::publish::{PublishConfirmation, PublishCorrelator};
use crate::subscription::{Multiplexer, SubscribeOptions, Subscription};
use crate::transport::{TransportFactory, WebSocketTransportFactory};
use nostr::{Event, Filter, Signer, verify_event};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const NOTIFICATION_CAPACITY: usize = 64;

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `ws://` or `wss://` URL of the relay.
    pub url: String,
    /// Display name.
    pub name: Option<String>,
    /// Used for subscriptions when part of a pool.
    pub read: bool,
    /// Used for publishing when part of a pool.
    pub write: bool,
    /// Default per-subscription event buffer.
    pub buffer_size: usize,
    /// Connection notifications buffered before the transport stops being read.
    pub listener_capacity: usize,
    /// Drop inbound events whose id or signature does not check out.
    pub verify_events: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Reconnect attempts after an unexpected close. 0 disables reconnecting.
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: None,
            read: true,
            write: true,
            buffer_size: 256,
            listener_capacity: 256,
            verify_events: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_listener_capacity(mut self, listener_capacity: usize) -> Self {
        self.listener_capacity = listener_capacity;
        self
    }

    pub fn with_verify_events(mut self, verify_events: bool) -> Self {
        self.verify_events = verify_events;
        self
    }

    /// Backoff starts at `delay`, doubles per attempt up to `max_delay`.
    pub fn with_reconnect(mut self, delay: Duration, max_delay: Duration, attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = max_delay;
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Relay-level notification, not tied to any subscription or publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    Connected {
        generation: u64,
    },
    Disconnected {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
    /// `["NOTICE", text]` from the relay.
    Notice(String),
    /// Advisory error: transport errors, extension failures.
    Error(String),
}

/// Builder for [`Relay`].
pub struct RelayBuilder {
    config: RelayConfig,
    transport: Option<Arc<dyn TransportFactory>>,
    extensions: Vec<Arc<dyn RelayExtension>>,
}

impl RelayBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_config(RelayConfig::new(url))
    }

    pub fn from_config(config: RelayConfig) -> Self {
        Self {
            config,
            transport: None,
            extensions: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn read(mut self, read: bool) -> Self {
        self.config.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.config.write = write;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    pub fn verify_events(mut self, verify_events: bool) -> Self {
        self.config.verify_events = verify_events;
        self
    }

    pub fn reconnect(mut self, delay: Duration, max_delay: Duration, attempts: u32) -> Self {
        self.config = self.config.with_reconnect(delay, max_delay, attempts);
        self
    }

    /// Transport used instead of WebSocket.
    pub fn transport(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register an extension. Handlers run in registration order.
    pub fn extension(mut self, extension: Arc<dyn RelayExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Answer NIP-42 auth challenges with `signer`.
    pub fn auth(self, signer: Arc<dyn Signer>) -> Self {
        self.extension(Arc::new(AuthExtension::new(signer)))
    }

    pub fn build(self) -> Result<Relay> {
        let url = Url::parse(&self.config.url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(WebSocketTransportFactory::new(self.config.connect_timeout))
        });
        let connection = Arc::new(LazyConnection::new(url, transport));
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Relay {
            inner: Arc::new(RelayInner {
                mux: Arc::new(Multiplexer::new(
                    Arc::clone(&connection),
                    self.config.buffer_size,
                )),
                correlator: PublishCorrelator::new(Arc::clone(&connection)),
                extensions: ExtensionRegistry::new(self.extensions),
                context: ExtensionContext::new(Arc::clone(&connection), notifications.clone()),
                connection,
                notifications,
                config: self.config,
                dispatcher: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        })
    }
}

struct RelayInner {
    config: RelayConfig,
    connection: Arc<LazyConnection>,
    mux: Arc<Multiplexer>,
    correlator: PublishCorrelator,
    extensions: ExtensionRegistry,
    context: ExtensionContext,
    notifications: broadcast::Sender<RelayNotification>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    reconnecting: AtomicBool,
}

/// One relay: subscribe, publish and close over a shared connection.
///
/// Cheap to clone; clones share the connection and every registry.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Relay with default configuration over WebSocket.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        RelayBuilder::new(url).build()
    }

    pub fn builder(url: impl Into<String>) -> RelayBuilder {
        RelayBuilder::new(url)
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.inner.connection.url().as_str()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.config.name.as_deref()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn can_read(&self) -> bool {
        self.inner.config.read
    }

    pub fn can_write(&self) -> bool {
        self.inner.config.write
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Names of the registered extensions, in dispatch order.
    pub fn extensions(&self) -> Vec<String> {
        self.inner.extensions.names()
    }

    /// Relay-level notifications from now on.
    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.inner.notifications.subscribe()
    }

    /// Open the connection now instead of on first use.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_dispatcher().await;
        self.inner.connection.connect().await
    }

    /// Register a subscription. The REQ is sent on the first poll.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.ensure_dispatcher().await;
        self.inner.mux.register(filters, options).await
    }

    /// Publish and wait for the relay's acceptance.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        self.send_event(event).await.map(|_| ())
    }

    /// Publish and return the relay's `OK` as a confirmation.
    ///
    /// Rejections are still errors, see [`ClientError::EventRejected`].
    pub async fn send_event(&self, event: &Event) -> Result<PublishConfirmation> {
        self.ensure_dispatcher().await;
        let message = self.inner.correlator.publish(event).await?;
        Ok(PublishConfirmation {
            relay_url: self.url().to_string(),
            event_id: event.id.clone(),
            accepted: true,
            message,
        })
    }

    /// Terminate every subscription and pending publish, then close the
    /// connection. The relay can be used again afterwards.
    pub async fn close(&self) -> Result<()> {
        self.inner.mux.fail_all().await;
        self.inner.correlator.fail_all();
        self.inner.connection.close().await
    }

    /// Live subscriptions on this relay.
    pub async fn subscription_count(&self) -> usize {
        self.inner.mux.len().await
    }

    /// Publishes still waiting for an `OK`.
    pub fn pending_publish_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    async fn ensure_dispatcher(&self) {
        let mut dispatcher = self.inner.dispatcher.lock().await;
        if dispatcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let (listener, events) = mpsc::channel(self.inner.config.listener_capacity.max(1));
        *dispatcher = Some(tokio::spawn(run_dispatcher(
            Arc::downgrade(&self.inner),
            events,
        )));
        self.inner.connection.add_listener(listener).await;
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = Arc::clone(&self.connection);
            runtime.spawn(async move {
                let _ = connection.close().await;
            });
        }
    }
}

async fn run_dispatcher(relay: Weak<RelayInner>, mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(relay) = relay.upgrade() else {
            break;
        };
        relay.handle_connection_event(event).await;
    }
}

impl RelayInner {
    fn url(&self) -> &str {
        self.connection.url().as_str()
    }

    fn notify(&self, notification: RelayNotification) {
        let _ = self.notifications.send(notification);
    }

    async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { generation } => {
                self.mux.on_open(generation).await;
                self.notify(RelayNotification::Connected { generation });
            }
            ConnectionEvent::Message { text, .. } => self.handle_text(&text).await,
            ConnectionEvent::Error { message, .. } => {
                self.notify(RelayNotification::Error(message));
            }
            ConnectionEvent::Closed {
                generation,
                code,
                reason,
                ..
            } => {
                self.correlator.on_closed(generation);
                self.notify(RelayNotification::Disconnected {
                    generation,
                    code,
                    reason,
                });
                if self.mux.has_requested().await {
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match parse_relay_message(text) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(error) => {
                warn!("dropping message from {}: {}", self.url(), error);
                return;
            }
        };

        if self.config.verify_events
            && let RelayMessage::Event(_, event) = &message
            && !verify_event(event)
        {
            warn!(
                "dropping event {} with invalid id or signature from {}",
                event.id,
                self.url()
            );
            return;
        }

        if self.extensions.dispatch(&self.context, &message).await == Dispatch::Consumed {
            return;
        }

        match message {
            RelayMessage::Event(subscription_id, event) => {
                self.mux.route_event(&subscription_id, event).await;
            }
            RelayMessage::Ok(event_id, accepted, text) => {
                self.correlator.on_ok(&event_id, accepted, &text);
            }
            RelayMessage::Eose(subscription_id) => self.mux.on_eose(&subscription_id).await,
            RelayMessage::Closed(subscription_id, reason) => {
                self.mux.on_closed(&subscription_id, &reason).await;
            }
            RelayMessage::Notice(text) => {
                info!("notice from {}: {}", self.url(), text);
                self.notify(RelayNotification::Notice(text));
            }
            other => debug!("unhandled {} message from {}", other.kind(), self.url()),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let relay = Arc::downgrade(self);
        tokio::spawn(reconnect(relay));
    }
}

/// Reopen the connection with exponential backoff while subscriptions
/// still need it.
async fn reconnect(relay: Weak<RelayInner>) {
    let Some(config) = relay.upgrade().map(|relay| relay.config.clone()) else {
        return;
    };
    let mut delay = config.reconnect_delay;

    for attempt in 1..=config.max_reconnect_attempts {
        tokio::time::sleep(delay).await;
        let Some(relay) = relay.upgrade() else {
            return;
        };
        if !relay.mux.has_requested().await {
            relay.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        if relay.connection.state() == ConnectionState::Open {
            relay.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        match relay.connection.connect().await {
            Ok(()) => {
                info!("reconnected to {} after {} attempt(s)", relay.url(), attempt);
                relay.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            Err(error) => {
                warn!(
                    "reconnect attempt {}/{} to {} failed: {}",
                    attempt,
                    config.max_reconnect_attempts,
                    relay.url(),
                    error
                );
            }
        }
        delay = (delay * 2).min(config.max_reconnect_delay);
    }

    let Some(relay) = relay.upgrade() else {
        return;
    };
    warn!(
        "giving up on {} after {} reconnect attempt(s)",
        relay.url(),
        config.max_reconnect_attempts
    );
    relay.mux.fail_all().await;
    relay.notify(RelayNotification::Error(format!(
        "gave up reconnecting to {}",
        relay.url()
    )));
    relay.reconnecting.store(false, Ordering::SeqCst);
}
