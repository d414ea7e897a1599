//! Protocol extension hooks.
//!
//! Optional protocol features (authentication, negentropy, ...) plug into a
//! relay as [`RelayExtension`]s. Each one declares the message types it
//! wants; the relay hands it every matching inbound message before the
//! default routing runs.

use crate::connection::{ConnectionState, LazyConnection};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::RelayNotification;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// What the relay should do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep going: later handlers and the default routing still see the message.
    Continue,
    /// Later handlers still run, the default routing is skipped.
    Consumed,
}

/// Handle given to extensions to talk back to the relay.
#[derive(Clone)]
pub struct ExtensionContext {
    connection: Arc<LazyConnection>,
    notifications: broadcast::Sender<RelayNotification>,
}

impl ExtensionContext {
    pub(crate) fn new(
        connection: Arc<LazyConnection>,
        notifications: broadcast::Sender<RelayNotification>,
    ) -> Self {
        Self {
            connection,
            notifications,
        }
    }

    pub fn relay_url(&self) -> &str {
        self.connection.url().as_str()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Send a message if the connection is open. Returns whether it went out.
    ///
    /// Handlers run on the relay's dispatcher, so they must not wait for a
    /// connection to open.
    pub async fn send(&self, message: ClientMessage) -> Result<bool> {
        self.connection.send_if_open(message.to_json()?).await
    }

    /// Surface an advisory message on the relay's notification channel.
    pub fn notify(&self, notification: RelayNotification) {
        let _ = self.notifications.send(notification);
    }
}

/// A pluggable handler for one or more relay message types.
#[async_trait]
pub trait RelayExtension: Send + Sync {
    fn name(&self) -> &str;

    /// Wire type tags this extension handles, e.g. `["AUTH"]`.
    fn message_types(&self) -> Vec<String>;

    async fn handle(&self, context: &ExtensionContext, message: &RelayMessage) -> Result<Dispatch>;
}

/// Extensions indexed by message type, in registration order.
#[derive(Default)]
pub(crate) struct ExtensionRegistry {
    extensions: Vec<Arc<dyn RelayExtension>>,
    routes: HashMap<String, Vec<usize>>,
}

impl ExtensionRegistry {
    pub(crate) fn new(extensions: Vec<Arc<dyn RelayExtension>>) -> Self {
        let mut routes: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, extension) in extensions.iter().enumerate() {
            for message_type in extension.message_types() {
                routes.entry(message_type).or_default().push(index);
            }
        }
        Self { extensions, routes }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|extension| extension.name().to_string())
            .collect()
    }

    /// Run every handler registered for the message's type.
    ///
    /// A failing handler is reported and treated as `Continue`; it never
    /// stops the others.
    pub(crate) async fn dispatch(
        &self,
        context: &ExtensionContext,
        message: &RelayMessage,
    ) -> Dispatch {
        let Some(indices) = self.routes.get(message.kind()) else {
            return Dispatch::Continue;
        };

        let mut outcome = Dispatch::Continue;
        for &index in indices {
            let extension = &self.extensions[index];
            match extension.handle(context, message).await {
                Ok(Dispatch::Consumed) => outcome = Dispatch::Consumed,
                Ok(Dispatch::Continue) => {}
                Err(error) => {
                    warn!(
                        "extension {} failed on {} from {}: {}",
                        extension.name(),
                        message.kind(),
                        context.relay_url(),
                        error
                    );
                    let failure = ClientError::Extension {
                        extension: extension.name().to_string(),
                        message: error.to_string(),
                    };
                    context.notify(RelayNotification::Error(failure.to_string()));
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransportFactory;
    use std::sync::Mutex;
    use url::Url;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        outcome: Option<Dispatch>,
    }

    #[async_trait]
    impl RelayExtension for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn message_types(&self) -> Vec<String> {
            vec!["NOTICE".to_string()]
        }

        async fn handle(
            &self,
            _context: &ExtensionContext,
            _message: &RelayMessage,
        ) -> Result<Dispatch> {
            self.seen.lock().unwrap().push(self.name.to_string());
            self.outcome
                .ok_or_else(|| ClientError::InvalidRequest("boom".to_string()))
        }
    }

    fn recorder(
        name: &'static str,
        seen: &Arc<Mutex<Vec<String>>>,
        outcome: Option<Dispatch>,
    ) -> Arc<dyn RelayExtension> {
        Arc::new(Recorder {
            name,
            seen: Arc::clone(seen),
            outcome,
        })
    }

    fn context() -> (ExtensionContext, broadcast::Receiver<RelayNotification>) {
        let connection = Arc::new(LazyConnection::new(
            Url::parse("wss://relay.example").unwrap(),
            Arc::new(MemoryTransportFactory::new()),
        ));
        let (notifications, receiver) = broadcast::channel(8);
        (ExtensionContext::new(connection, notifications), receiver)
    }

    #[tokio::test]
    async fn handlers_run_in_order_despite_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ExtensionRegistry::new(vec![
            recorder("first", &seen, None),
            recorder("second", &seen, Some(Dispatch::Consumed)),
            recorder("third", &seen, Some(Dispatch::Continue)),
        ]);
        let (context, mut notifications) = context();

        let outcome = registry
            .dispatch(&context, &RelayMessage::Notice("hi".to_string()))
            .await;
        assert_eq!(outcome, Dispatch::Consumed);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
        match notifications.try_recv() {
            Ok(RelayNotification::Error(message)) => assert!(message.contains("first")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_types_pass_through() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry =
            ExtensionRegistry::new(vec![recorder("notice-only", &seen, Some(Dispatch::Consumed))]);
        let (context, _notifications) = context();
        let outcome = registry
            .dispatch(&context, &RelayMessage::Eose("sub".to_string()))
            .await;
        assert_eq!(outcome, Dispatch::Continue);
        assert_eq!(registry.names(), vec!["notice-only".to_string()]);
    }
}
