//! Duplex message transport boundary.
//!
//! The engine only needs to create a transport for a URL, send text, ask it
//! to close, and observe `open`/`message`/`error`/`close` notifications.
//! [`WebSocketTransportFactory`] is the production implementation.

use crate::error::{ClientError, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};
use url::Url;

/// Notification emitted by a transport instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    /// Always the last notification of an instance, whether or not it opened.
    Close {
        code: Option<u16>,
        reason: String,
    },
}

/// A live transport instance.
pub trait Transport: Send + Sync {
    /// Queue `text` for transmission. Must not block.
    fn send(&self, text: String) -> Result<()>;

    /// Request closure. Completion is reported as [`TransportEvent::Close`].
    fn close(&self, code: Option<u16>, reason: Option<String>);
}

/// Receiving half of a transport's notifications.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Creates transport instances.
///
/// `connect` returns immediately; the instance reports `Open` (or `Close`
/// without `Open` on failure) through the returned receiver.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, url: &Url) -> Result<(Arc<dyn Transport>, TransportEvents)>;
}

const DEFAULT_EVENT_BUFFER: usize = 256;

/// WebSocket transports over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    connect_timeout: Duration,
    event_buffer: usize,
}

impl WebSocketTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Inbound notifications buffered before the socket stops being read.
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }
}

impl Default for WebSocketTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn connect(&self, url: &Url) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| ClientError::Internal(format!("no tokio runtime: {}", error)))?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.event_buffer);

        runtime.spawn(run_socket(
            url.clone(),
            self.connect_timeout,
            command_rx,
            event_tx,
        ));

        Ok((Arc::new(WebSocketTransport { commands: command_tx }), event_rx))
    }
}

enum Command {
    Send(String),
    Close(Option<u16>, Option<String>),
}

struct WebSocketTransport {
    commands: mpsc::UnboundedSender<Command>,
}

impl Transport for WebSocketTransport {
    fn send(&self, text: String) -> Result<()> {
        self.commands
            .send(Command::Send(text))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) {
        let _ = self.commands.send(Command::Close(code, reason));
    }
}

async fn run_socket(
    url: Url,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
) {
    let stream = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(error)) => {
            let _ = events.send(TransportEvent::Error(error.to_string())).await;
            let _ = events
                .send(TransportEvent::Close {
                    code: None,
                    reason: "connect failed".to_string(),
                })
                .await;
            return;
        }
        Err(_) => {
            let _ = events
                .send(TransportEvent::Error(format!(
                    "connection timeout after {:?}",
                    connect_timeout
                )))
                .await;
            let _ = events
                .send(TransportEvent::Close {
                    code: None,
                    reason: "connect timeout".to_string(),
                })
                .await;
            return;
        }
    };

    if events.send(TransportEvent::Open).await.is_err() {
        return;
    }

    let (mut writer, mut reader) = stream.split();
    let mut close_code = None;
    let mut close_reason = String::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(error) = writer.send(Message::Text(text.into())).await {
                        warn!("websocket write error on {}: {}", url, error);
                        let _ = events.send(TransportEvent::Error(error.to_string())).await;
                        break;
                    }
                }
                Some(Command::Close(code, reason)) => {
                    let frame = code.map(|code| CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.unwrap_or_default().into(),
                    });
                    if writer.send(Message::Close(frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Message(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_code = Some(u16::from(frame.code));
                        close_reason = frame.reason.to_string();
                    }
                    break;
                }
                Some(Ok(Message::Ping(payload))) => {
                    debug!("received ping from {} ({} bytes)", url, payload.len());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!("websocket read error on {}: {}", url, error);
                    let _ = events.send(TransportEvent::Error(error.to_string())).await;
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events
        .send(TransportEvent::Close {
            code: close_code,
            reason: close_reason,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_socket_reports_close_without_open() {
        let factory = WebSocketTransportFactory::new(Duration::from_secs(2));
        let url = Url::parse("ws://127.0.0.1:1").unwrap();
        let (_transport, mut events) = factory.connect(&url).unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert!(!seen.contains(&TransportEvent::Open));
        assert!(matches!(seen.last(), Some(TransportEvent::Close { .. })));
    }

    #[test]
    fn connect_outside_runtime_is_an_error() {
        let factory = WebSocketTransportFactory::default();
        let url = Url::parse("ws://127.0.0.1:1").unwrap();
        assert!(matches!(
            factory.connect(&url),
            Err(ClientError::Internal(_))
        ));
    }
}
