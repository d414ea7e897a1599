//! Nostr relay client engine.
//!
//! - [`Relay`]: one lazily opened, auto-reconnecting relay connection with
//!   multiplexed subscriptions and correlated publishes
//! - [`RelayPool`]: fanout over many relays with cross-relay dedup
//! - [`RelayExtension`]: per-message-type hooks for optional protocol
//!   features, with NIP-42 auth as [`AuthExtension`]
//!
//! The wire transport is pluggable through [`TransportFactory`]; WebSocket
//! is the default and [`memory`] provides an in-process one.

pub mod api;
pub mod auth;
pub mod connection;
pub mod error;
pub mod extension;
pub mod memory;
pub mod message;
pub mod pool;
pub mod publish;
pub mod relay;
pub mod subscription;
pub mod transport;

pub use api::{EventStream, RelayApi};
pub use auth::AuthExtension;
pub use connection::{ConnectionEvent, ConnectionState, LazyConnection};
pub use error::{ClientError, RelayFailure, Result};
pub use extension::{Dispatch, ExtensionContext, RelayExtension};
pub use memory::{MemoryPeer, MemoryTransportFactory};
pub use message::{ClientMessage, RelayMessage, parse_relay_message};
pub use pool::{PoolConfig, PoolSubscription, RelayPool};
pub use publish::PublishConfirmation;
pub use relay::{Relay, RelayBuilder, RelayConfig, RelayNotification};
pub use subscription::{SubscribeOptions, Subscription, generate_subscription_id};
pub use transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};
