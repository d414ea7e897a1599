//! Relay pool for multi-relay fanout.

use crate::api::{EventStream, RelayApi};
use crate::error::{ClientError, RelayFailure, Result};
use crate::publish::PublishConfirmation;
use crate::relay::{RelayBuilder, RelayConfig};
use crate::subscription::SubscribeOptions;
use crate::transport::TransportFactory;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, SelectAll};
use futures_util::{Stream, StreamExt};
use nostr::{Event, Filter};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use tracing::{debug, warn};
use url::Url;

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
        }
    }
}

type Member = Arc<dyn RelayApi>;

/// A group of relays behind the single-relay contract.
///
/// Members never share a connection. Subscriptions fan out to readable
/// members and are merged with first-wins dedup by event id; publishes race
/// the writable members.
pub struct RelayPool {
    relays: RwLock<HashMap<String, Member>>,
    config: PoolConfig,
    transport: Option<Arc<dyn TransportFactory>>,
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
            config,
            transport: None,
        }
    }

    /// Transport used for relays created by [`add_relay`](Self::add_relay).
    pub fn with_transport(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn read_members(&self) -> RwLockReadGuard<'_, HashMap<String, Member>> {
        self.relays.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_members(&self) -> RwLockWriteGuard<'_, HashMap<String, Member>> {
        self.relays.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a relay by URL, configured from the pool's template.
    ///
    /// Adding a URL that is already a member is a no-op.
    pub fn add_relay(&self, url: &str) -> Result<()> {
        if self.read_members().contains_key(&member_key(url)) {
            return Ok(());
        }
        let mut builder =
            RelayBuilder::from_config(self.config.relay_config.clone().with_url(url));
        if let Some(transport) = &self.transport {
            builder = builder.transport(Arc::clone(transport));
        }
        self.add_member(Arc::new(builder.build()?))
    }

    /// Add any relay-contract implementer, keyed by its URL.
    pub fn add_member(&self, member: Member) -> Result<()> {
        let mut relays = self.write_members();
        let url = member_key(member.url());
        if relays.contains_key(&url) {
            return Ok(());
        }
        if relays.len() >= self.config.max_relays {
            return Err(ClientError::InvalidRequest(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        debug!("added relay {} to pool", url);
        relays.insert(url, member);
        Ok(())
    }

    /// Remove a relay and close it.
    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        let removed = self.write_members().remove(&member_key(url));
        match removed {
            Some(member) => {
                member.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Get relay by URL.
    pub fn relay(&self, url: &str) -> Option<Member> {
        self.read_members().get(&member_key(url)).cloned()
    }

    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.read_members().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn len(&self) -> usize {
        self.read_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_members().is_empty()
    }

    fn members(&self, select: impl Fn(&Member) -> bool) -> Vec<Member> {
        self.read_members()
            .values()
            .filter(|member| select(member))
            .cloned()
            .collect()
    }

    /// Subscribe on every readable member and merge the results.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscribeOptions,
    ) -> Result<PoolSubscription> {
        let readers = self.members(|member| member.can_read());
        if readers.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let member_count = readers.len();
        let mut streams = SelectAll::new();
        let mut failures = Vec::new();
        for member in readers {
            let relay_url = member.url().to_string();
            match member.subscribe(filters.clone(), options.clone()).await {
                Ok(stream) => streams.push(tag_stream(relay_url, stream)),
                Err(error) => {
                    warn!("subscribe failed on {}: {}", relay_url, error);
                    failures.push(RelayFailure { relay_url, error });
                }
            }
        }

        if failures.len() == member_count {
            return Err(ClientError::AllRelaysFailed(failures));
        }
        Ok(PoolSubscription {
            streams,
            seen: HashSet::new(),
            failures,
            member_count,
            finished: false,
        })
    }

    /// Publish to every writable member; resolves on the first acceptance.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let writers = self.members(|member| member.can_write());
        if writers.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let mut attempts = spawn_publishes(writers, event);
        let mut failures = Vec::new();
        while let Some((relay_url, outcome)) = attempts.next().await {
            match outcome {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!("publish of {} failed on {}: {}", event.id, relay_url, error);
                    failures.push(RelayFailure { relay_url, error });
                }
            }
        }
        Err(ClientError::AllRelaysFailed(failures))
    }

    /// Publish to every writable member and report each outcome.
    pub async fn publish_all(&self, event: &Event) -> Result<Vec<PublishConfirmation>> {
        let writers = self.members(|member| member.can_write());
        if writers.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let mut attempts = spawn_publishes(writers, event);
        let mut confirmations = Vec::new();
        while let Some((relay_url, outcome)) = attempts.next().await {
            let (accepted, message) = match outcome {
                Ok(()) => (true, String::new()),
                Err(ClientError::EventRejected { reason, .. }) => (false, reason),
                Err(error) => (false, error.to_string()),
            };
            confirmations.push(PublishConfirmation {
                relay_url,
                event_id: event.id.clone(),
                accepted,
                message,
            });
        }
        confirmations.sort_by(|a, b| a.relay_url.cmp(&b.relay_url));
        Ok(confirmations)
    }

    /// Close every member. All are attempted; the first error is returned.
    pub async fn close(&self) -> Result<()> {
        let members = self.members(|_| true);
        let mut first_error = None;
        for member in members {
            if let Err(error) = member.close().await {
                warn!("failed to close {}: {}", member.url(), error);
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

type Attempt = Pin<Box<dyn Future<Output = (String, Result<()>)> + Send>>;

/// One task per member, so a slow relay never holds up the others.
/// Map key for a relay URL, so `wss://host` and `wss://host/` name the same member.
fn member_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => url.to_string(),
    }
}

fn spawn_publishes(members: Vec<Member>, event: &Event) -> FuturesUnordered<Attempt> {
    let attempts = FuturesUnordered::new();
    for member in members {
        let relay_url = member.url().to_string();
        let event = event.clone();
        let task = tokio::spawn(async move { member.publish(&event).await });
        let attempt: Attempt = Box::pin(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(error) => Err(ClientError::Internal(format!(
                    "publish task failed: {}",
                    error
                ))),
            };
            (relay_url, outcome)
        });
        attempts.push(attempt);
    }
    attempts
}

type TaggedStream = Pin<Box<dyn Stream<Item = (String, Result<Event>)> + Send>>;

fn tag_stream(relay_url: String, stream: EventStream) -> TaggedStream {
    Box::pin(stream.map(move |item| (relay_url.clone(), item)))
}

/// Merged, deduplicated events from every readable member.
///
/// A member failure is logged and that member drops out. Only when every
/// member failed does the stream end with [`ClientError::AllRelaysFailed`].
/// Dropping it cancels every member subscription.
pub struct PoolSubscription {
    streams: SelectAll<TaggedStream>,
    seen: HashSet<String>,
    failures: Vec<RelayFailure>,
    member_count: usize,
    finished: bool,
}

impl PoolSubscription {
    /// Next unique event, `None` once every member is done.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        StreamExt::next(self).await
    }
}

impl Stream for PoolSubscription {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match this.streams.poll_next_unpin(cx) {
                Poll::Ready(Some((_, Ok(event)))) => {
                    if this.seen.insert(event.id.clone()) {
                        return Poll::Ready(Some(Ok(event)));
                    }
                }
                Poll::Ready(Some((relay_url, Err(error)))) => {
                    warn!("pool member {} failed: {}", relay_url, error);
                    this.failures.push(RelayFailure { relay_url, error });
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    if this.failures.len() >= this.member_count {
                        let failures = std::mem::take(&mut this.failures);
                        return Poll::Ready(Some(Err(ClientError::AllRelaysFailed(failures))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for PoolSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSubscription")
            .field("members", &self.member_count)
            .field("seen", &self.seen.len())
            .field("failures", &self.failures.len())
            .finish()
    }
}

#[async_trait]
impl RelayApi for RelayPool {
    fn url(&self) -> &str {
        "pool"
    }

    fn can_read(&self) -> bool {
        self.read_members().values().any(|member| member.can_read())
    }

    fn can_write(&self) -> bool {
        self.read_members().values().any(|member| member.can_write())
    }

    async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscribeOptions,
    ) -> Result<EventStream> {
        let subscription = RelayPool::subscribe(self, filters, options).await?;
        Ok(Box::pin(subscription))
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        RelayPool::publish(self, event).await
    }

    async fn close(&self) -> Result<()> {
        RelayPool::close(self).await
    }
}
