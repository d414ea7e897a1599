//! Client error types.

use nostr::Event;
use std::fmt;
use thiserror::Error;

/// One member's failure inside a pool operation.
#[derive(Debug)]
pub struct RelayFailure {
    pub relay_url: String,
    pub error: ClientError,
}

impl fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.relay_url, self.error)
    }
}

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport closed before it ever opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection dropped while the operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("event rejected: {reason}")]
    EventRejected { reason: String, event: Box<Event> },

    #[error("subscription {subscription_id} closed by relay: {reason}")]
    SubscriptionClosed {
        subscription_id: String,
        reason: String,
    },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("extension {extension} failed: {message}")]
    Extension { extension: String, message: String },

    #[error("subscription id already in use: {0}")]
    DuplicateSubscription(String),

    #[error("event {0} already has a pending publish")]
    DuplicatePublish(String),

    #[error("all relays failed: {}", join_failures(.0))]
    AllRelaysFailed(Vec<RelayFailure>),

    #[error("no relay available for this operation")]
    NoRelays,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("signer error: {0}")]
    Signer(#[from] nostr::Nip01Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn join_failures(failures: &[RelayFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_member() {
        let error = ClientError::AllRelaysFailed(vec![
            RelayFailure {
                relay_url: "wss://a".to_string(),
                error: ClientError::ConnectionClosed,
            },
            RelayFailure {
                relay_url: "wss://b".to_string(),
                error: ClientError::ConnectionFailed("refused".to_string()),
            },
        ]);
        let rendered = error.to_string();
        assert!(rendered.contains("wss://a: connection closed"));
        assert!(rendered.contains("wss://b: connection failed: refused"));
    }
}
