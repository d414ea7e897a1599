//! NIP-42 client authentication.

use crate::error::Result;
use crate::extension::{Dispatch, ExtensionContext, RelayExtension};
use crate::message::{ClientMessage, RelayMessage};
use async_trait::async_trait;
use nostr::{EventTemplate, KIND_CLIENT_AUTH, Signer};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers `["AUTH", challenge]` with a signed kind-22242 event.
pub struct AuthExtension {
    signer: Arc<dyn Signer>,
}

impl AuthExtension {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }
}

/// Build the unsigned authentication event for `relay_url`.
pub fn auth_template(relay_url: &str, challenge: &str) -> EventTemplate {
    EventTemplate::new(KIND_CLIENT_AUTH, "")
        .tag(["relay", relay_url])
        .tag(["challenge", challenge])
}

#[async_trait]
impl RelayExtension for AuthExtension {
    fn name(&self) -> &str {
        "nip42-auth"
    }

    fn message_types(&self) -> Vec<String> {
        vec!["AUTH".to_string()]
    }

    async fn handle(&self, context: &ExtensionContext, message: &RelayMessage) -> Result<Dispatch> {
        let RelayMessage::Auth(challenge) = message else {
            return Ok(Dispatch::Continue);
        };

        let event = self
            .signer
            .sign_event(auth_template(context.relay_url(), challenge))
            .await?;
        if context.send(ClientMessage::Auth(event)).await? {
            debug!("answered auth challenge from {}", context.relay_url());
        } else {
            warn!(
                "auth challenge from {} arrived on a closed connection",
                context.relay_url()
            );
        }
        Ok(Dispatch::Consumed)
    }
}
