//! The relay contract shared by single relays and pools.

use crate::error::Result;
use crate::relay::Relay;
use crate::subscription::SubscribeOptions;
use async_trait::async_trait;
use futures_util::Stream;
use nostr::{Event, Filter};
use std::pin::Pin;

/// Boxed stream of events returned through [`RelayApi`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Anything that can be subscribed to and published through.
///
/// [`RelayPool`](crate::RelayPool) is generic over this trait, and also
/// implements it, so pools can be nested or members faked in tests.
#[async_trait]
pub trait RelayApi: Send + Sync {
    fn url(&self) -> &str;

    fn can_read(&self) -> bool;

    fn can_write(&self) -> bool;

    async fn subscribe(&self, filters: Vec<Filter>, options: SubscribeOptions)
    -> Result<EventStream>;

    async fn publish(&self, event: &Event) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl RelayApi for Relay {
    fn url(&self) -> &str {
        Relay::url(self)
    }

    fn can_read(&self) -> bool {
        Relay::can_read(self)
    }

    fn can_write(&self) -> bool {
        Relay::can_write(self)
    }

    async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscribeOptions,
    ) -> Result<EventStream> {
        let subscription = Relay::subscribe(self, filters, options).await?;
        Ok(Box::pin(subscription))
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        Relay::publish(self, event).await
    }

    async fn close(&self) -> Result<()> {
        Relay::close(self).await
    }
}
