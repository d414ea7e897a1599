//! Lazily established, reconnect-on-demand relay connection.
//!
//! A [`LazyConnection`] owns at most one transport instance at a time. No
//! transport exists until something needs one; after a close, the next send
//! creates a fresh instance. Each instance gets a new generation number so
//! notifications from a dead instance can be told apart from the live one.
//!
//! State changes come only from transport notifications and are broadcast
//! through a `watch` channel, so every task waiting on a transition sees it.

use crate::error::{ClientError, Result};
use crate::transport::{Transport, TransportEvent, TransportEvents, TransportFactory};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Notification forwarded to connection listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened {
        generation: u64,
    },
    Message {
        generation: u64,
        text: String,
    },
    Error {
        generation: u64,
        message: String,
    },
    Closed {
        generation: u64,
        was_open: bool,
        code: Option<u16>,
        reason: String,
    },
}

/// Listener registered with [`LazyConnection::add_listener`].
pub type ConnectionListener = mpsc::Sender<ConnectionEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: ConnectionState,
    generation: u64,
    was_open: bool,
}

struct Slot {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
}

struct Shared {
    url: Url,
    factory: Arc<dyn TransportFactory>,
    slot: Mutex<Slot>,
    status: watch::Sender<Status>,
    listeners: Mutex<Vec<ConnectionListener>>,
}

/// Single relay connection with lazy open and ordered close.
pub struct LazyConnection {
    shared: Arc<Shared>,
    send_gate: Mutex<()>,
}

impl LazyConnection {
    pub fn new(url: Url, factory: Arc<dyn TransportFactory>) -> Self {
        let (status, _) = watch::channel(Status {
            state: ConnectionState::Closed,
            generation: 0,
            was_open: false,
        });
        Self {
            shared: Arc::new(Shared {
                url,
                factory,
                slot: Mutex::new(Slot {
                    transport: None,
                    generation: 0,
                }),
                status,
                listeners: Mutex::new(Vec::new()),
            }),
            send_gate: Mutex::new(()),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    /// Generation of the most recent transport instance (0 before the first).
    pub fn generation(&self) -> u64 {
        self.shared.status.borrow().generation
    }

    /// Register a listener for every future transport instance.
    ///
    /// Creates a transport if none exists so the first `Opened` is observed,
    /// but never waits for it to open.
    pub async fn add_listener(&self, listener: ConnectionListener) {
        self.shared.listeners.lock().await.push(listener);
        if self.state() == ConnectionState::Closed
            && let Err(error) = self.spawn_transport().await
        {
            warn!("failed to create transport for {}: {}", self.shared.url, error);
        }
    }

    /// Wait until the connection is open, creating a transport if needed.
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.send_gate.lock().await;
        self.wait_open().await.map(|_| ())
    }

    /// Transmit `message`, opening the connection first if needed.
    pub async fn send(&self, message: String) -> Result<()> {
        self.send_on(message).await.map(|_| ())
    }

    /// Like [`send`](Self::send), returning the generation it went out on.
    pub(crate) async fn send_on(&self, message: String) -> Result<u64> {
        let _gate = self.send_gate.lock().await;
        let (generation, transport) = self.wait_open().await?;
        transport.send(message)?;
        Ok(generation)
    }

    /// Transmit only if already open. Never creates a transport.
    pub async fn send_if_open(&self, message: String) -> Result<bool> {
        self.try_send_on(message)
            .await
            .map(|generation| generation.is_some())
    }

    /// Like [`send_if_open`](Self::send_if_open), returning the generation
    /// the message went out on.
    pub(crate) async fn try_send_on(&self, message: String) -> Result<Option<u64>> {
        let slot = self.shared.slot.lock().await;
        let status = *self.shared.status.borrow();
        match &slot.transport {
            Some(transport)
                if status.state == ConnectionState::Open
                    && status.generation == slot.generation =>
            {
                transport.send(message)?;
                Ok(Some(slot.generation))
            }
            _ => Ok(None),
        }
    }

    /// Close the current transport and wait for its close notification.
    pub async fn close(&self) -> Result<()> {
        let mut status_rx = self.shared.status.subscribe();
        let generation = {
            let slot = self.shared.slot.lock().await;
            let Some(transport) = slot.transport.clone() else {
                return Ok(());
            };
            let current = *self.shared.status.borrow();
            if current.state != ConnectionState::Closing {
                self.shared.status.send_replace(Status {
                    state: ConnectionState::Closing,
                    ..current
                });
                transport.close(Some(1000), Some("closed by client".to_string()));
            }
            slot.generation
        };

        loop {
            let status = *status_rx.borrow_and_update();
            if status.generation != generation || status.state == ConnectionState::Closed {
                return Ok(());
            }
            status_rx
                .changed()
                .await
                .map_err(|_| ClientError::Internal("connection state dropped".to_string()))?;
        }
    }

    async fn wait_open(&self) -> Result<(u64, Arc<dyn Transport>)> {
        let mut status_rx = self.shared.status.subscribe();
        let mut attempt = None;

        loop {
            let status = *status_rx.borrow_and_update();
            match status.state {
                ConnectionState::Open => {
                    let slot = self.shared.slot.lock().await;
                    if slot.generation == status.generation
                        && let Some(transport) = &slot.transport
                    {
                        return Ok((status.generation, Arc::clone(transport)));
                    }
                }
                ConnectionState::Closed => {
                    if attempt == Some(status.generation) && !status.was_open {
                        return Err(ClientError::ConnectionFailed(format!(
                            "{} closed before opening",
                            self.shared.url
                        )));
                    }
                    attempt = Some(self.spawn_transport().await?);
                    continue;
                }
                ConnectionState::Connecting => attempt = Some(status.generation),
                ConnectionState::Closing => {}
            }

            status_rx
                .changed()
                .await
                .map_err(|_| ClientError::Internal("connection state dropped".to_string()))?;
        }
    }

    async fn spawn_transport(&self) -> Result<u64> {
        let mut slot = self.shared.slot.lock().await;
        if slot.transport.is_some() {
            return Ok(slot.generation);
        }

        let (transport, events) = self.shared.factory.connect(&self.shared.url)?;
        slot.generation += 1;
        slot.transport = Some(transport);
        let generation = slot.generation;
        self.shared.status.send_replace(Status {
            state: ConnectionState::Connecting,
            generation,
            was_open: false,
        });
        debug!("created transport #{} for {}", generation, self.shared.url);

        tokio::spawn(pump(Arc::clone(&self.shared), generation, events));
        Ok(generation)
    }
}

/// Drive one transport instance's notifications into state and listeners.
async fn pump(shared: Arc<Shared>, generation: u64, mut events: TransportEvents) {
    let mut was_open = false;
    let mut code = None;
    let mut reason = String::new();

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Open => {
                if shared.mark_open(generation).await {
                    was_open = true;
                    info!("connected to relay: {}", shared.url);
                    shared.forward(ConnectionEvent::Opened { generation }).await;
                }
            }
            TransportEvent::Message(text) => {
                shared
                    .forward(ConnectionEvent::Message { generation, text })
                    .await;
            }
            TransportEvent::Error(message) => {
                warn!("transport error on {}: {}", shared.url, message);
                shared
                    .forward(ConnectionEvent::Error {
                        generation,
                        message,
                    })
                    .await;
            }
            TransportEvent::Close {
                code: close_code,
                reason: close_reason,
            } => {
                code = close_code;
                reason = close_reason;
                break;
            }
        }
    }

    {
        let mut slot = shared.slot.lock().await;
        if slot.generation == generation {
            slot.transport = None;
            shared.status.send_replace(Status {
                state: ConnectionState::Closed,
                generation,
                was_open,
            });
        }
    }
    info!("disconnected from relay: {} ({:?} {})", shared.url, code, reason);

    shared
        .forward(ConnectionEvent::Closed {
            generation,
            was_open,
            code,
            reason,
        })
        .await;
}

impl Shared {
    async fn mark_open(&self, generation: u64) -> bool {
        let slot = self.slot.lock().await;
        let current = *self.status.borrow();
        if slot.generation != generation || current.state != ConnectionState::Connecting {
            return false;
        }
        self.status.send_replace(Status {
            state: ConnectionState::Open,
            generation,
            was_open: true,
        });
        true
    }

    async fn forward(&self, event: ConnectionEvent) {
        let listeners = self.listeners.lock().await.clone();
        let mut dropped = false;
        for listener in &listeners {
            if listener.send(event.clone()).await.is_err() {
                dropped = true;
            }
        }
        if dropped {
            self.listeners
                .lock()
                .await
                .retain(|listener| !listener.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransportFactory;
    use std::time::Duration;
    use tokio::time::timeout;

    fn connection(factory: &MemoryTransportFactory) -> Arc<LazyConnection> {
        Arc::new(LazyConnection::new(
            Url::parse("wss://relay.example").unwrap(),
            Arc::new(factory.clone()),
        ))
    }

    #[tokio::test]
    async fn starts_closed_without_transport() {
        let factory = MemoryTransportFactory::new();
        let conn = connection(&factory);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(factory.connect_count(), 0);
        conn.close().await.unwrap();
        assert_eq!(factory.connect_count(), 0);
        assert!(!conn.send_if_open("x".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn send_waits_for_open() {
        let factory = MemoryTransportFactory::new();
        let conn = connection(&factory);

        let sender = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send("hello".to_string()).await })
        };
        let peer = factory.wait_for_peer(0).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(peer.sent().is_empty());

        peer.open().await;
        sender.await.unwrap().unwrap();
        assert_eq!(peer.sent(), vec!["hello".to_string()]);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn concurrent_senders_share_one_transport() {
        let factory = MemoryTransportFactory::new();
        let conn = connection(&factory);

        let mut tasks = Vec::new();
        for index in 0..5 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.send(format!("m{index}")).await
            }));
        }
        let peer = factory.wait_for_peer(0).await;
        peer.open().await;
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(factory.connect_count(), 1);
        assert_eq!(peer.sent().len(), 5);
    }

    #[tokio::test]
    async fn close_before_open_fails_send() {
        let factory = MemoryTransportFactory::refusing();
        let conn = connection(&factory);
        let result = timeout(Duration::from_secs(2), conn.send("x".to_string()))
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reopens_after_close() {
        let factory = MemoryTransportFactory::auto_open();
        let conn = connection(&factory);

        conn.send("first".to_string()).await.unwrap();
        let first_generation = conn.generation();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(factory.wait_for_peer(0).await.close_requested());

        conn.send("second".to_string()).await.unwrap();
        assert_eq!(factory.connect_count(), 2);
        assert_eq!(conn.generation(), first_generation + 1);
        assert_eq!(factory.wait_for_peer(1).await.sent(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn listener_sees_every_instance() {
        let factory = MemoryTransportFactory::new();
        let conn = connection(&factory);
        let (tx, mut rx) = mpsc::channel(16);
        conn.add_listener(tx).await;

        // Registration alone creates the transport without opening it.
        let peer = factory.wait_for_peer(0).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);

        peer.open().await;
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Opened { generation: 1 }));
        peer.deliver("[\"NOTICE\",\"hi\"]").await;
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::Message { generation: 1, .. })
        ));
        peer.close(Some(1001), "going away").await;
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Closed {
                generation: 1,
                was_open: true,
                code: Some(1001),
                reason: "going away".to_string(),
            })
        );

        let sender = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send("again".to_string()).await })
        };
        factory.wait_for_peer(1).await.open().await;
        sender.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Opened { generation: 2 }));
    }
}
