//! In-process transport driven by the caller.
//!
//! Every `connect` creates a [`MemoryPeer`]: the remote end of that transport
//! instance. The peer decides when the transport opens, what messages arrive
//! and when it closes, and records everything the client sent. Used for tests
//! and local simulations.

use crate::error::Result;
use crate::transport::{Transport, TransportEvent, TransportEvents, TransportFactory};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use url::Url;

const PEER_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Manual,
    AutoOpen,
    Refuse,
}

struct FactoryState {
    mode: ConnectMode,
    peers: Mutex<Vec<MemoryPeer>>,
    created: watch::Sender<usize>,
}

/// Factory of in-memory transports.
#[derive(Clone)]
pub struct MemoryTransportFactory {
    state: Arc<FactoryState>,
}

impl MemoryTransportFactory {
    /// Transports stay connecting until [`MemoryPeer::open`] is called.
    pub fn new() -> Self {
        Self::with_mode(ConnectMode::Manual)
    }

    /// Transports open as soon as they are created.
    pub fn auto_open() -> Self {
        Self::with_mode(ConnectMode::AutoOpen)
    }

    /// Transports close without ever opening.
    pub fn refusing() -> Self {
        Self::with_mode(ConnectMode::Refuse)
    }

    fn with_mode(mode: ConnectMode) -> Self {
        let (created, _) = watch::channel(0);
        Self {
            state: Arc::new(FactoryState {
                mode,
                peers: Mutex::new(Vec::new()),
                created,
            }),
        }
    }

    /// Number of transport instances created so far.
    pub fn connect_count(&self) -> usize {
        lock(&self.state.peers).len()
    }

    pub fn peers(&self) -> Vec<MemoryPeer> {
        lock(&self.state.peers).clone()
    }

    /// Wait for the `index`-th transport instance (0-based).
    pub async fn wait_for_peer(&self, index: usize) -> MemoryPeer {
        let mut created = self.state.created.subscribe();
        loop {
            if let Some(peer) = lock(&self.state.peers).get(index).cloned() {
                return peer;
            }
            if created.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn connect(&self, url: &Url) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        let (events, receiver) = mpsc::channel(PEER_EVENT_BUFFER);
        let (sent_count, _) = watch::channel(0);
        let peer = MemoryPeer {
            url: url.clone(),
            events,
            sent: Arc::new(Mutex::new(Vec::new())),
            sent_count: Arc::new(sent_count),
            close_requested: Arc::new(AtomicBool::new(false)),
        };

        match self.state.mode {
            ConnectMode::Manual => {}
            ConnectMode::AutoOpen => {
                let _ = peer.events.try_send(TransportEvent::Open);
            }
            ConnectMode::Refuse => {
                let _ = peer
                    .events
                    .try_send(TransportEvent::Error("connection refused".to_string()));
                let _ = peer.events.try_send(TransportEvent::Close {
                    code: None,
                    reason: "connection refused".to_string(),
                });
            }
        }

        let count = {
            let mut peers = lock(&self.state.peers);
            peers.push(peer.clone());
            peers.len()
        };
        self.state.created.send_replace(count);

        Ok((Arc::new(MemoryTransport { peer }), receiver))
    }
}

/// Remote end of one in-memory transport instance.
#[derive(Clone)]
pub struct MemoryPeer {
    url: Url,
    events: mpsc::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    sent_count: Arc<watch::Sender<usize>>,
    close_requested: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn open(&self) {
        let _ = self.events.send(TransportEvent::Open).await;
    }

    /// Deliver a raw text frame to the client.
    pub async fn deliver(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into())).await;
    }

    pub async fn deliver_json(&self, value: &Value) {
        self.deliver(value.to_string()).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Error(message.into())).await;
    }

    /// Close from the remote side.
    pub async fn close(&self, code: Option<u16>, reason: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Close {
                code,
                reason: reason.into(),
            })
            .await;
    }

    /// Everything the client sent on this instance, in order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Sent messages parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Wait until at least `count` messages were sent, then return them all.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        let mut sent_count = self.sent_count.subscribe();
        loop {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            if sent_count.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Whether the client asked this instance to close.
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

struct MemoryTransport {
    peer: MemoryPeer,
}

impl Transport for MemoryTransport {
    fn send(&self, text: String) -> Result<()> {
        let count = {
            let mut sent = lock(&self.peer.sent);
            sent.push(text);
            sent.len()
        };
        self.peer.sent_count.send_replace(count);
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) {
        if self.peer.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer.events.try_send(TransportEvent::Close {
            code,
            reason: reason.unwrap_or_default(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
